//! End-to-end scan of a synthetic target.
//!
//! Builds a fake runtime in a flat memory buffer — an `mheap_` with one in-use span,
//! a one-bit arena bitmap, a module descriptor list — plus two package globals:
//!
//! - `main.list`, a `*main.Node` heading a three-node linked list in the span
//! - `main.blob`, a `*uint8` that actually references a node holding one further
//!   pointer (an unsafe cast dropping type visibility)
//!
//! and checks the emitted profile: typed chains for the list, the residue of the
//! hidden pointer attributed under `$sub_objects$`, and conservation of total bytes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;
use std::sync::Arc;

use prost::Message;

use grf_core::error::{Error, Result};
use grf_core::mem::{Memory, MemoryReader};
use grf_core::profile::proto;
use grf_core::target::{Architecture, ClosureVarEntry, FrameInfo, FuncInfo, Target, TaskInfo, VarEntry};
use grf_core::types::{fake_array_type, Address, RefType, StructField, TypeKind};

// layout of the synthetic target
const MHEAP: u64 = 0x10000;
const ALLSPANS_ARRAY: u64 = 0x10100;
const MSPAN: u64 = 0x10200;
const ARENA_L2: u64 = 0x10300;
const HEAP_ARENA: u64 = 0x10500;
const MODULEDATA: u64 = 0x11000;
const GLOBALS: u64 = 0x20000;
const SPAN_BASE: u64 = 0x100000;
const ELEM_SIZE: u64 = 64;

struct FlatMemory
{
    base: u64,
    bytes: RefCell<Vec<u8>>,
}

impl FlatMemory
{
    fn put_u64(&self, addr: u64, value: u64)
    {
        let start = (addr - self.base) as usize;
        self.bytes.borrow_mut()[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u8(&self, addr: u64, value: u8)
    {
        let start = (addr - self.base) as usize;
        self.bytes.borrow_mut()[start] = value;
    }
}

impl MemoryReader for FlatMemory
{
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize>
    {
        let bytes = self.bytes.borrow();
        if addr < self.base || (addr - self.base) as usize >= bytes.len() {
            return Err(Error::ReadMemory {
                addr,
                reason: "unmapped".to_string(),
            });
        }
        let start = (addr - self.base) as usize;
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }
}

fn field(name: &str, typ: &Arc<RefType>, offset: i64) -> StructField
{
    StructField {
        name: name.to_string(),
        typ: typ.clone(),
        byte_offset: offset,
    }
}

/// `main.Node`: one pointer slot followed by padding, unrolled a few levels deep so
/// the type tree stays acyclic.
fn node_type(levels: usize) -> Arc<RefType>
{
    let byte = RefType::base("uint8", 1);
    let next_elem = if levels == 0 { RefType::void() } else { node_type(levels - 1) };
    let next_ptr = RefType::new("*main.Node", 8, TypeKind::Ptr { elem: next_elem });
    RefType::new(
        "main.Node",
        ELEM_SIZE as i64,
        TypeKind::Struct {
            fields: vec![
                field("next", &next_ptr, 0),
                field("pad", &fake_array_type(56, &byte), 8),
            ],
        },
    )
}

struct MockTarget
{
    mem: Rc<FlatMemory>,
    mheap_typ: Arc<RefType>,
    moduledata_typ: Arc<RefType>,
    globals: Vec<VarEntry>,
}

impl MockTarget
{
    fn new() -> MockTarget
    {
        let mem = Rc::new(FlatMemory {
            base: MHEAP,
            bytes: RefCell::new(vec![0u8; (0x200000 - MHEAP) as usize]),
        });

        let uintptr = RefType::base("uintptr", 8);
        let u8_typ = RefType::base("uint8", 1);
        let u16_typ = RefType::base("uint16", 2);
        let i32_typ = RefType::base("int32", 4);

        // runtime.special / runtime.specialfinalizer (present but unused: no specials)
        let special = RefType::new(
            "runtime.special",
            16,
            TypeKind::Struct {
                fields: vec![
                    field("offset", &u16_typ, 8),
                    field("kind", &u8_typ, 10),
                ],
            },
        );
        let special_ptr = RefType::new("*runtime.special", 8, TypeKind::Ptr { elem: special.clone() });
        let special_with_next = RefType::new(
            "runtime.special",
            16,
            TypeKind::Struct {
                fields: vec![
                    field("next", &special_ptr, 0),
                    field("offset", &u16_typ, 8),
                    field("kind", &u8_typ, 10),
                ],
            },
        );
        let special_link = RefType::new("*runtime.special", 8, TypeKind::Ptr { elem: special_with_next });

        // runtime.mspan
        let mspan = RefType::new(
            "runtime.mspan",
            48,
            TypeKind::Struct {
                fields: vec![
                    field("startAddr", &uintptr, 0),
                    field("elemsize", &uintptr, 8),
                    field("npages", &uintptr, 16),
                    field("state", &u8_typ, 24),
                    field("spanclass", &u8_typ, 25),
                    field("largeType", &uintptr, 32),
                    field("specials", &special_link, 40),
                ],
            },
        );
        let mspan_ptr = RefType::new("*runtime.mspan", 8, TypeKind::Ptr { elem: mspan });
        let allspans = RefType::new(
            "[]*runtime.mspan",
            24,
            TypeKind::Slice {
                elem: mspan_ptr.clone(),
                fields: vec![
                    field("array", &RefType::new("**runtime.mspan", 8, TypeKind::Ptr { elem: mspan_ptr }), 0),
                    field("len", &RefType::base("int", 8), 8),
                    field("cap", &RefType::base("int", 8), 16),
                ],
            },
        );

        // runtime.heapArena with a one-bit bitmap
        let bitmap = fake_array_type(2048, &uintptr);
        let no_more_ptrs = fake_array_type(32, &u8_typ);
        let heap_arena = RefType::new(
            "runtime.heapArena",
            32 + 2048 * 8,
            TypeKind::Struct {
                fields: vec![
                    field("noMorePtrs", &no_more_ptrs, 0),
                    field("bitmap", &bitmap, 32),
                ],
            },
        );
        let heap_arena_ptr = RefType::new("*runtime.heapArena", 8, TypeKind::Ptr { elem: heap_arena });
        let arena_l2 = fake_array_type(32, &heap_arena_ptr);
        let arena_l2_ptr = RefType::new("*[32]*runtime.heapArena", 8, TypeKind::Ptr { elem: arena_l2 });
        let arenas = fake_array_type(1, &arena_l2_ptr);

        let mheap_typ = RefType::new(
            "runtime.mheap",
            32,
            TypeKind::Struct {
                fields: vec![field("allspans", &allspans, 0), field("arenas", &arenas, 24)],
            },
        );

        // runtime.moduledata with empty segments
        let bitvector = RefType::new(
            "runtime.bitvector",
            16,
            TypeKind::Struct {
                fields: vec![field("n", &i32_typ, 0), field("bytedata", &uintptr, 8)],
            },
        );
        let moduledata_fields = vec![
            field("data", &uintptr, 0),
            field("edata", &uintptr, 8),
            field("bss", &uintptr, 16),
            field("ebss", &uintptr, 24),
            field("gcdatamask", &bitvector, 32),
            field("gcbssmask", &bitvector, 48),
            field("next", &RefType::new("*runtime.moduledata", 8, TypeKind::Ptr { elem: RefType::void() }), 64),
        ];
        let moduledata_typ = RefType::new(
            "runtime.moduledata",
            72,
            TypeKind::Struct {
                fields: moduledata_fields,
            },
        );

        // mheap_: allspans slice + arenas table
        mem.put_u64(MHEAP, ALLSPANS_ARRAY);
        mem.put_u64(MHEAP + 8, 1);
        mem.put_u64(MHEAP + 16, 1);
        mem.put_u64(MHEAP + 24, ARENA_L2);
        mem.put_u64(ALLSPANS_ARRAY, MSPAN);

        // the span: one page of 64-byte objects
        mem.put_u64(MSPAN, SPAN_BASE);
        mem.put_u64(MSPAN + 8, ELEM_SIZE);
        mem.put_u64(MSPAN + 16, 1);
        mem.put_u8(MSPAN + 24, 1); // mSpanInUse
        mem.put_u8(MSPAN + 25, 4);
        mem.put_u64(MSPAN + 40, 0); // no specials

        // arena table: L2 slot 1 covers [0x100000, 0x200000)
        mem.put_u64(ARENA_L2 + 8, HEAP_ARENA);
        // pointer words at span offsets 0, 64, 128, 192, 256
        mem.put_u64(HEAP_ARENA + 32, 1 | 1 << 8 | 1 << 16 | 1 << 24 | 1 << 32);

        // the linked list: N1 -> N2 -> N3
        mem.put_u64(SPAN_BASE, SPAN_BASE + ELEM_SIZE);
        mem.put_u64(SPAN_BASE + ELEM_SIZE, SPAN_BASE + 2 * ELEM_SIZE);
        mem.put_u64(SPAN_BASE + 2 * ELEM_SIZE, 0);
        // the hidden object: N4 -> N5
        mem.put_u64(SPAN_BASE + 3 * ELEM_SIZE, SPAN_BASE + 4 * ELEM_SIZE);
        mem.put_u64(SPAN_BASE + 4 * ELEM_SIZE, 0);

        // package globals
        mem.put_u64(GLOBALS, SPAN_BASE);
        mem.put_u64(GLOBALS + 8, SPAN_BASE + 3 * ELEM_SIZE);

        let node = node_type(4);
        let list_typ = RefType::new("*main.Node", 8, TypeKind::Ptr { elem: node });
        let blob_typ = RefType::new("*uint8", 8, TypeKind::Ptr { elem: RefType::base("uint8", 1) });
        let globals = vec![
            VarEntry {
                name: "main.list".to_string(),
                typ: list_typ,
                addr: GLOBALS,
                depth: 0,
                is_parameter: false,
            },
            VarEntry {
                name: "main.blob".to_string(),
                typ: blob_typ,
                addr: GLOBALS + 8,
                depth: 0,
                is_parameter: false,
            },
        ];

        MockTarget {
            mem,
            mheap_typ,
            moduledata_typ,
            globals,
        }
    }
}

impl Target for MockTarget
{
    fn memory(&self) -> Memory
    {
        self.mem.clone()
    }

    fn architecture(&self) -> Architecture
    {
        Architecture::Amd64
    }

    fn go_version(&self) -> Option<(u32, u32)>
    {
        Some((1, 22))
    }

    fn runtime_global(&self, name: &str) -> Result<Option<(Address, Arc<RefType>)>>
    {
        Ok(match name {
            "runtime.mheap_" => Some((Address::new(MHEAP), self.mheap_typ.clone())),
            "runtime.firstmoduledata" => Some((Address::new(MODULEDATA), self.moduledata_typ.clone())),
            _ => None,
        })
    }

    fn runtime_constant(&self, name: &str) -> Result<Option<i64>>
    {
        Ok(match name {
            "_PageSize" => Some(4096),
            "mSpanInUse" => Some(1),
            "heapArenaBytes" => Some(0x100000),
            "_KindSpecialFinalizer" => Some(1),
            "arenaBaseOffsetUintptr" => Some(0),
            "arenaL1Bits" => Some(0),
            "arenaL2Bits" => Some(5),
            "minSizeForMallocHeader" => Some(512),
            _ => None,
        })
    }

    fn find_type(&self, _name: &str) -> Result<Option<Arc<RefType>>>
    {
        Ok(None)
    }

    fn global_variables(&self) -> Result<Vec<VarEntry>>
    {
        Ok(self.globals.clone())
    }

    fn tasks(&self) -> Result<Vec<TaskInfo>>
    {
        Ok(Vec::new())
    }

    fn stacktrace(&self, _task: &TaskInfo, _max_frames: usize) -> Result<Vec<FrameInfo>>
    {
        Ok(Vec::new())
    }

    fn frame_variables(&self, _task: &TaskInfo, _frame_index: usize) -> Result<Vec<VarEntry>>
    {
        Ok(Vec::new())
    }

    fn pc_to_func(&self, _pc: u64) -> Option<FuncInfo>
    {
        None
    }

    fn closure_variables(&self, _func: &FuncInfo) -> Result<Vec<ClosureVarEntry>>
    {
        Ok(Vec::new())
    }

    fn runtime_type_to_type(&self, _type_addr: u64, _data_addr: u64) -> Result<Option<(Arc<RefType>, i64)>>
    {
        Ok(None)
    }
}

fn decode_profile(bytes: &[u8]) -> proto::Profile
{
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw).unwrap();
    proto::Profile::decode(raw.as_slice()).unwrap()
}

/// Chains keyed by their decoded names, leaf first.
fn samples_by_chain(profile: &proto::Profile) -> HashMap<Vec<String>, (i64, i64)>
{
    profile
        .sample
        .iter()
        .map(|sample| {
            let chain: Vec<String> = sample
                .location_id
                .iter()
                .map(|id| profile.string_table[*id as usize].clone())
                .collect();
            (chain, (sample.value[0], sample.value[1]))
        })
        .collect()
}

#[test]
fn test_scan_synthetic_target()
{
    let target = MockTarget::new();
    let mut out = Vec::new();
    grf_core::analyze(&target, &mut out).unwrap();

    let profile = decode_profile(&out);
    assert_eq!(profile.string_table[1], "inuse_objects");
    assert_eq!(profile.string_table[3], "inuse_space");

    let chains = samples_by_chain(&profile);

    // the typed list chain: one edge per named hop, one 64-byte node each
    let next = "next. (*main.Node)".to_string();
    assert_eq!(chains[&vec!["main.list".to_string()]], (1, 64));
    assert_eq!(chains[&vec![next.clone(), "main.list".to_string()]], (1, 64));
    assert_eq!(
        chains[&vec![next.clone(), next.clone(), "main.list".to_string()]],
        (1, 64)
    );

    // the unsafe cast: the *uint8 target at its declared chain, the hidden pointee
    // under the residue bucket
    assert_eq!(chains[&vec!["main.blob".to_string()]], (1, 64));
    assert_eq!(
        chains[&vec!["$sub_objects$".to_string(), "main.blob".to_string()]],
        (1, 64)
    );

    // conservation: five 64-byte objects are reachable, no more, no less
    let total_space: i64 = profile.sample.iter().map(|sample| sample.value[1]).sum();
    let total_objects: i64 = profile.sample.iter().map(|sample| sample.value[0]).sum();
    assert_eq!(total_space, 5 * 64);
    assert_eq!(total_objects, 5);
}

#[test]
fn test_scan_is_deterministic()
{
    // two fresh scans of identical targets agree on the decoded samples
    let mut first = Vec::new();
    grf_core::analyze(&MockTarget::new(), &mut first).unwrap();
    let mut second = Vec::new();
    grf_core::analyze(&MockTarget::new(), &mut second).unwrap();
    assert_eq!(
        samples_by_chain(&decode_profile(&first)),
        samples_by_chain(&decode_profile(&second))
    );
}
