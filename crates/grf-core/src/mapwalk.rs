//! # Map-Bucket Walker
//!
//! Version-adaptive iteration over the runtime's two hash-map representations:
//!
//! - the **classic bucketed hmap** (`B`/`buckets`/`oldbuckets`, tophash sentinel
//!   bytes, overflow chains, grow-in-progress evacuation rules)
//! - the **swiss-table group directory** (`dirPtr`/`dirLen`, control bytes, slot
//!   arrays, indirect key/value storage for oversized types)
//!
//! The dialect is selected structurally from the map header's fields; the only
//! version-string dependence in the analyzer is the classic empty-cell sentinel pair,
//! which changed in Go 1.12. Both dialects expose the same `next`/`key`/`value`/
//! `reference_info` contract and share nothing else.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::mem::read_uint_raw;
use crate::types::{fake_array_type, pointer_to, RefType, StructField, TypeKind};
use crate::vars::ReferenceVariable;
use crate::walker::RefWalker;

// tophash sentinels; the empty-one/min-top-hash pair moved in Go 1.12
const HASH_TOPHASH_EMPTY_ZERO: u64 = 0;
const HASH_TOPHASH_EMPTY_ONE: u64 = 1;
const HASH_MIN_TOP_HASH_GO111: u64 = 4;
const HASH_MIN_TOP_HASH_GO112: u64 = 5;

/// A slot is empty or deleted iff this bit of its control byte is set.
const SWISS_CTRL_EMPTY: u8 = 0b1000_0000;

static EVACUATION_AMBIGUITY_LOGGED: AtomicBool = AtomicBool::new(false);

/// The ambiguous-oldbucket case is tolerated (treated as evacuated) and reported once
/// per run.
fn note_evacuation_ambiguity()
{
    if !EVACUATION_AMBIGUITY_LOGGED.swap(true, Ordering::Relaxed) {
        debug!("ambiguous oldbucket evacuation state; treating as evacuated");
    }
}

/// The walker-facing iterator: one of the two closed dialects.
pub enum MapWalker
{
    Classic(ClassicMapWalker),
    Swiss(SwissMapWalker),
}

impl MapWalker
{
    pub fn next<W: Write>(&mut self, scope: &RefWalker<'_, W>) -> bool
    {
        match self {
            MapWalker::Classic(it) => it.next(scope),
            MapWalker::Swiss(it) => it.next(scope),
        }
    }

    pub fn key(&self) -> Option<ReferenceVariable>
    {
        match self {
            MapWalker::Classic(it) => it.kv(it.keys.as_ref()),
            MapWalker::Swiss(it) => it.cur_key.clone(),
        }
    }

    pub fn value(&self) -> Option<ReferenceVariable>
    {
        match self {
            MapWalker::Classic(it) => it.kv(it.values.as_ref()),
            MapWalker::Swiss(it) => it.cur_value.clone(),
        }
    }

    /// The heap objects discovered while iterating, plus their total size and count
    /// for aggregation into the map's parent.
    pub fn reference_info(self) -> (Vec<ReferenceVariable>, i64, i64)
    {
        match self {
            MapWalker::Classic(it) => (it.objects, it.size, it.count),
            MapWalker::Swiss(it) => (it.objects, it.size, it.count),
        }
    }
}

/// Build the iterator matching the header's structural dialect.
///
/// `hmap` is the already-discovered header object; its accumulated size and count seed
/// the iterator totals so the whole map flattens into one parent edge.
pub fn to_map_walker<W: Write>(
    scope: &RefWalker<'_, W>,
    hmap: ReferenceVariable,
    key_type: &Arc<RefType>,
    elem_type: &Arc<RefType>,
) -> Result<MapWalker>
{
    if hmap.addr.is_null() {
        return Err(Error::MalformedRuntime("empty hmap addr".to_string()));
    }
    let TypeKind::Struct { fields } = &hmap.typ.kind else {
        return Err(Error::MalformedRuntime("wrong real type for map".to_string()));
    };
    let fields = fields.clone();

    let mut classic = ClassicMapWalker {
        numbuckets: 0,
        oldmask: 0,
        buckets: None,
        oldbuckets: None,
        b: None,
        bidx: 0,
        tophashes: None,
        keys: None,
        values: None,
        overflow: None,
        idx: 0,
        empty_one: HASH_TOPHASH_EMPTY_ZERO,
        min_top_hash: HASH_MIN_TOP_HASH_GO111,
        objects: Vec::new(),
        size: hmap.size,
        count: hmap.count,
    };
    let mut swiss = SwissMapWalker::new(key_type.is_ptr(), elem_type.is_ptr(), hmap.size, hmap.count);
    let mut saw_classic = false;

    for field in &fields {
        match field.name.as_str() {
            "B" => {
                saw_classic = true;
                let b = read_uint_raw(&hmap.mem, hmap.addr.add_signed(field.byte_offset).value(), 1)?;
                classic.numbuckets = 1u64.checked_shl(b as u32).unwrap_or(0);
                classic.oldmask = match b {
                    0 => 0,
                    _ => 1u64.checked_shl(b as u32 - 1).unwrap_or(0).wrapping_sub(1),
                };
            }
            "buckets" => {
                saw_classic = true;
                let slot = hmap.to_field(field);
                if let Some(buckets) = scope.dereference(&slot) {
                    classic.size += buckets.size;
                    classic.count += buckets.count;
                    classic.objects.push(buckets.clone());
                    classic.buckets = Some(buckets);
                }
            }
            "oldbuckets" => {
                saw_classic = true;
                let slot = hmap.to_field(field);
                if let Some(oldbuckets) = scope.dereference(&slot) {
                    classic.size += oldbuckets.size;
                    classic.count += oldbuckets.count;
                    classic.objects.push(oldbuckets.clone());
                    classic.oldbuckets = Some(oldbuckets);
                }
            }

            // swiss-table map fields
            "dirPtr" => {
                swiss.dir_ptr = Some(ReferenceVariable::new(
                    hmap.addr.add_signed(field.byte_offset),
                    "",
                    field.typ.clone(),
                    hmap.mem.clone(),
                    hmap.hb.clone(),
                ));
            }
            "dirLen" => {
                swiss.dir_len = crate::mem::read_int_raw(&hmap.mem, hmap.addr.add_signed(field.byte_offset).value(), 8)?;
            }
            _ => {}
        }
    }

    if classic.buckets.is_none() && swiss.dir_ptr.is_some() {
        swiss.load_types(scope)?;
        return Ok(MapWalker::Swiss(swiss));
    }
    if !saw_classic {
        return Err(Error::MalformedRuntime("map header has neither hmap nor swiss fields".to_string()));
    }

    for buckets in [&classic.buckets, &classic.oldbuckets].into_iter().flatten() {
        if !matches!(buckets.typ.kind, TypeKind::Struct { .. }) {
            return Err(Error::MalformedRuntime(
                "buckets, oldbuckets or overflow field not a struct".to_string(),
            ));
        }
    }

    if matches!(scope.heap.target.go_version(), Some((major, minor)) if (major, minor) >= (1, 12)) {
        classic.empty_one = HASH_TOPHASH_EMPTY_ONE;
        classic.min_top_hash = HASH_MIN_TOP_HASH_GO112;
    }
    Ok(MapWalker::Classic(classic))
}

/// Iterator over the classic bucketed hmap.
pub struct ClassicMapWalker
{
    numbuckets: u64,
    oldmask: u64,
    buckets: Option<ReferenceVariable>,
    oldbuckets: Option<ReferenceVariable>,
    b: Option<ReferenceVariable>,
    bidx: u64,

    tophashes: Option<ReferenceVariable>,
    keys: Option<ReferenceVariable>,
    values: Option<ReferenceVariable>,
    overflow: Option<ReferenceVariable>,

    idx: i64,

    empty_one: u64,
    min_top_hash: u64,

    objects: Vec<ReferenceVariable>,
    size: i64,
    count: i64,
}

impl ClassicMapWalker
{
    fn next_bucket<W: Write>(&mut self, scope: &RefWalker<'_, W>) -> bool
    {
        if let Some(overflow) = self.overflow.take() {
            if !overflow.addr.is_null() {
                self.b = Some(overflow);
            } else {
                self.b = None;
            }
        } else {
            self.b = None;
        }
        if self.b.is_none() {
            while self.bidx < self.numbuckets {
                let Some(buckets) = &self.buckets else {
                    break;
                };
                let stride = buckets.typ.size;
                let mut b = buckets.clone();
                b.addr = b.addr.add_signed(stride * self.bidx as i64);

                let Some(oldbuckets) = &self.oldbuckets else {
                    self.b = Some(b);
                    break;
                };

                // If oldbuckets is not nil we are iterating through a map that is in
                // the middle of a grow. If the bucket we are looking at hasn't been
                // filled in, iterate instead through its corresponding oldbucket (the
                // bucket its elements are coming from), but only for the first of the
                // two buckets created from the same oldbucket, to avoid yielding keys
                // twice.
                let oldbidx = self.bidx & self.oldmask;
                let mut oldb = oldbuckets.clone();
                oldb.addr = oldb.addr.add_signed(oldbuckets.typ.size * oldbidx as i64);

                if self.map_evacuated(&oldb) {
                    self.b = Some(b);
                    break;
                }

                if oldbidx == self.bidx {
                    self.b = Some(oldb);
                    break;
                }

                // the oldbucket origin for this bucket has not been evacuated but we
                // have already iterated over it; skip
                self.bidx += 1;
            }

            if self.b.is_none() {
                return false;
            }
            self.bidx += 1;
        }

        let b = self.b.clone().unwrap();
        if b.addr.is_null() {
            return false;
        }

        self.tophashes = None;
        self.keys = None;
        self.values = None;
        self.overflow = None;

        let Some(fields) = b.typ.fields().map(<[StructField]>::to_vec) else {
            debug!("malformed map type");
            return false;
        };
        for field in &fields {
            match field.name.as_str() {
                "tophash" => self.tophashes = Some(b.to_field(field)),
                "keys" => self.keys = Some(b.to_field(field)),
                "values" => self.values = Some(b.to_field(field)),
                "overflow" => {
                    let slot = b.to_field(field);
                    if let Some(overflow) = scope.dereference(&slot) {
                        self.count += overflow.count;
                        self.size += overflow.size;
                        self.objects.push(overflow.clone());
                        self.overflow = Some(overflow);
                    }
                }
                _ => {}
            }
        }

        // sanity checks
        let (Some(tophashes), Some(keys), Some(values)) = (&self.tophashes, &self.keys, &self.values) else {
            debug!("malformed map type");
            return false;
        };
        let counts = [&tophashes.typ, &keys.typ, &values.typ].map(|typ| match &typ.kind {
            TypeKind::Array { count, .. } => Some(*count),
            _ => None,
        });
        let [Some(tophash_count), Some(key_count), Some(value_count)] = counts else {
            debug!("malformed map type: keys, values or tophash of a bucket is not an array");
            return false;
        };
        if tophash_count != key_count {
            debug!("malformed map type: inconsistent array length in bucket");
            return false;
        }
        let value_size = match &values.typ.kind {
            TypeKind::Array { elem, .. } => elem.size,
            _ => 0,
        };
        if value_size > 0 && tophash_count != value_count {
            // zero-sized values (struct{}) legitimately have an empty values array
            debug!("malformed map type: inconsistent array length in bucket");
            return false;
        }
        if let Some(overflow) = &self.overflow {
            if !matches!(overflow.typ.kind, TypeKind::Struct { .. }) {
                debug!("malformed map type: overflow field not a struct");
                return false;
            }
        }
        true
    }

    fn next<W: Write>(&mut self, scope: &RefWalker<'_, W>) -> bool
    {
        loop {
            if self.b.is_none() {
                if !self.next_bucket(scope) {
                    return false;
                }
                self.idx = 0;
            }
            let tophash_count = self.tophashes.as_ref().map_or(0, |t| match &t.typ.kind {
                TypeKind::Array { count, .. } => *count,
                _ => 0,
            });
            if self.idx >= tophash_count {
                if !self.next_bucket(scope) {
                    return false;
                }
                self.idx = 0;
            }
            let tophashes = self.tophashes.as_ref().unwrap();
            let (elem, stride) = match &tophashes.typ.kind {
                TypeKind::Array { elem, stride, .. } => (elem.clone(), *stride),
                _ => return false,
            };
            let cell = tophashes.element(self.idx, &elem, stride);
            let Ok(h) = read_uint_raw(&cell.mem, cell.addr.value(), 1) else {
                debug!("unreadable tophash");
                return false;
            };
            self.idx += 1;
            if h != HASH_TOPHASH_EMPTY_ZERO && h != self.empty_one {
                return true;
            }
        }
    }

    fn kv(&self, v: Option<&ReferenceVariable>) -> Option<ReferenceVariable>
    {
        let v = v?;
        let (elem, stride) = match &v.typ.kind {
            TypeKind::Array { elem, stride, .. } => (elem.clone(), *stride),
            _ => return None,
        };
        Some(v.element(self.idx - 1, &elem, stride))
    }

    fn map_evacuated(&self, b: &ReferenceVariable) -> bool
    {
        if b.addr.is_null() {
            return true;
        }
        let Some(fields) = b.typ.fields() else {
            note_evacuation_ambiguity();
            return true;
        };
        for field in fields {
            if field.name != "tophash" {
                continue;
            }
            return match read_uint_raw(&b.mem, b.addr.add_signed(field.byte_offset).value(), 1) {
                Ok(tophash0) => tophash0 > self.empty_one && tophash0 < self.min_top_hash,
                Err(_) => {
                    note_evacuation_ambiguity();
                    true
                }
            };
        }
        note_evacuation_ambiguity();
        true
    }
}

/// Iterator over the swiss-table group directory.
pub struct SwissMapWalker
{
    dir_ptr: Option<ReferenceVariable>,
    dir_len: i64,

    key_is_ptr: bool,
    elem_is_ptr: bool,
    group_type: Option<Arc<RefType>>,

    // cached field handles, resolved once instead of per bucket
    table_field_index: Option<StructField>,
    table_field_groups: Option<StructField>,
    groups_field_length_mask: Option<StructField>,
    groups_field_data: Option<StructField>,
    group_field_ctrl: Option<StructField>,
    group_field_slots: Option<StructField>,
    slot_field_key: Option<StructField>,
    slot_field_elem: Option<StructField>,

    dir_idx: i64,
    tab: Option<SwissTable>,
    group_idx: i64,
    group: Option<SwissGroup>,
    slot_idx: i64,

    cur_key: Option<ReferenceVariable>,
    cur_value: Option<ReferenceVariable>,

    objects: Vec<ReferenceVariable>,
    size: i64,
    count: i64,
}

struct SwissTable
{
    index: i64,
    groups: ReferenceVariable,
}

struct SwissGroup
{
    slots: ReferenceVariable,
    ctrls: Vec<u8>,
}

impl SwissMapWalker
{
    fn new(key_is_ptr: bool, elem_is_ptr: bool, size: i64, count: i64) -> SwissMapWalker
    {
        SwissMapWalker {
            dir_ptr: None,
            dir_len: 0,
            key_is_ptr,
            elem_is_ptr,
            group_type: None,
            table_field_index: None,
            table_field_groups: None,
            groups_field_length_mask: None,
            groups_field_data: None,
            group_field_ctrl: None,
            group_field_slots: None,
            slot_field_key: None,
            slot_field_elem: None,
            dir_idx: 0,
            tab: None,
            group_idx: 0,
            group: None,
            slot_idx: 0,
            cur_key: None,
            cur_value: None,
            objects: Vec::new(),
            size,
            count,
        }
    }

    /// Determine the real type behind `dirPtr`: the linker records it as `**table` but
    /// it is either `*[dirLen]*table` for normal maps or `*group` for small maps
    /// (`dirLen <= 0`).
    fn load_types<W: Write>(&mut self, scope: &RefWalker<'_, W>) -> Result<()>
    {
        let bad = |msg: &str| Error::MalformedRuntime(msg.to_string());
        let dir_ptr = self.dir_ptr.as_ref().ok_or_else(|| bad("swiss table bad table field"))?;
        let table_ptr_typ = dir_ptr
            .typ
            .ptr_elem()
            .ok_or_else(|| bad("swiss table bad table field"))?
            .clone();
        let table_typ = table_ptr_typ
            .ptr_elem()
            .ok_or_else(|| bad("swiss table bad table field"))?
            .clone();
        let TypeKind::Struct { fields: table_fields } = &table_typ.kind else {
            return Err(bad("swiss table bad table field"));
        };
        for field in table_fields {
            match field.name.as_str() {
                "index" => self.table_field_index = Some(field.clone()),
                "groups" => {
                    self.table_field_groups = Some(field.clone());
                    if let TypeKind::Struct { fields: group_fields } = &field.typ.kind {
                        for field in group_fields {
                            match field.name.as_str() {
                                "data" => {
                                    self.groups_field_data = Some(field.clone());
                                    if let Some(elem) = field.typ.ptr_elem() {
                                        if matches!(elem.kind, TypeKind::Struct { .. }) {
                                            self.group_type = Some(elem.clone());
                                        }
                                    }
                                }
                                "lengthMask" => self.groups_field_length_mask = Some(field.clone()),
                                _ => {}
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if self.group_type.is_none()
            || self.table_field_index.is_none()
            || self.table_field_groups.is_none()
            || self.groups_field_length_mask.is_none()
        {
            return Err(bad("swiss table type does not have some required fields"));
        }
        let group_type = self.group_type.clone().unwrap();
        let TypeKind::Struct { fields: group_fields } = &group_type.kind else {
            return Err(bad("bad swiss map type, group type lacks some required fields"));
        };
        for field in group_fields {
            match field.name.as_str() {
                "ctrl" => self.group_field_ctrl = Some(field.clone()),
                "slots" => self.group_field_slots = Some(field.clone()),
                _ => {}
            }
        }
        let (Some(_), Some(slots_field)) = (&self.group_field_ctrl, &self.group_field_slots) else {
            return Err(bad("bad swiss map type, group type lacks some required fields"));
        };
        let TypeKind::Array { elem: slot_typ, .. } = &slots_field.typ.kind else {
            return Err(bad("bad swiss map type, group type lacks some required fields"));
        };
        let TypeKind::Struct { fields: slot_fields } = &slot_typ.kind else {
            return Err(bad("bad swiss map type, group type lacks some required fields"));
        };
        for field in slot_fields {
            match field.name.as_str() {
                "key" => self.slot_field_key = Some(field.clone()),
                "elem" => self.slot_field_elem = Some(field.clone()),
                _ => {}
            }
        }
        if self.slot_field_key.is_none() || self.slot_field_elem.is_none() {
            return Err(bad("bad swiss map type, group type lacks some required fields"));
        }

        if self.dir_len <= 0 {
            // small map: dirPtr targets a single group
            let mut dir_ptr = self.dir_ptr.take().unwrap();
            dir_ptr.typ = pointer_to(&fake_array_type(1, &group_type));
            let dir_ptr = scope
                .dereference(&dir_ptr)
                .ok_or_else(|| bad("could not load one of the tables"))?;
            self.size += dir_ptr.size;
            self.count += dir_ptr.count;
            self.objects.push(dir_ptr.clone());
            self.dir_len = 1;
            // synthesize the table so the directory loop skips loading it
            self.tab = Some(SwissTable {
                index: 0,
                groups: dir_ptr.clone(),
            });
            self.dir_ptr = Some(dir_ptr);
            return Ok(());
        }

        // normal map: dirPtr targets a [dirLen]*table directory
        let mut dir_ptr = self.dir_ptr.take().unwrap();
        dir_ptr.typ = pointer_to(&fake_array_type(self.dir_len as u64, &table_ptr_typ));
        let dir_ptr = scope
            .dereference(&dir_ptr)
            .ok_or_else(|| bad("could not load one of the tables"))?;
        self.size += dir_ptr.size;
        self.count += dir_ptr.count;
        self.objects.push(dir_ptr.clone());
        self.dir_ptr = Some(dir_ptr);
        Ok(())
    }

    fn next<W: Write>(&mut self, scope: &RefWalker<'_, W>) -> bool
    {
        while self.dir_idx < self.dir_len {
            if self.tab.is_none() {
                if self.load_current_table(scope).is_err() {
                    return false;
                }
                if self.tab.as_ref().unwrap().index != self.dir_idx {
                    self.next_table();
                    continue;
                }
            }

            let count_groups = match &self.tab.as_ref().unwrap().groups.typ.kind {
                TypeKind::Array { count, .. } => *count,
                _ => 0,
            };
            while self.group_idx < count_groups {
                if self.group.is_none() && self.load_current_group().is_err() {
                    return false;
                }
                let group = self.group.as_ref().unwrap();
                let (count_slots, slot_typ, slot_stride) = match &group.slots.typ.kind {
                    TypeKind::Array { elem, count, stride } => (*count, elem.clone(), *stride),
                    _ => return false,
                };
                while self.slot_idx < count_slots {
                    if self.slot_is_empty_or_deleted(self.slot_idx) {
                        self.slot_idx += 1;
                        continue;
                    }

                    let cur = group.slots.element(self.slot_idx, &slot_typ, slot_stride);
                    let (Some(key_field), Some(elem_field)) = (&self.slot_field_key, &self.slot_field_elem) else {
                        return false;
                    };
                    let mut cur_key = Some(cur.to_field(key_field));
                    let mut cur_value = Some(cur.to_field(elem_field));

                    // Keys or values too large for inline storage are stored behind a
                    // pointer; dereference so the yielded variable matches the map's
                    // declared key/value type.
                    let mut extra = Vec::new();
                    if cur_key.as_ref().unwrap().typ.is_ptr() && !self.key_is_ptr {
                        cur_key = scope.dereference(cur_key.as_ref().unwrap());
                        if let Some(k) = &cur_key {
                            extra.push(k.clone());
                        }
                    }
                    if cur_value.as_ref().unwrap().typ.is_ptr() && !self.elem_is_ptr {
                        cur_value = scope.dereference(cur_value.as_ref().unwrap());
                        if let Some(v) = &cur_value {
                            extra.push(v.clone());
                        }
                    }
                    for obj in extra {
                        self.size += obj.size;
                        self.count += obj.count;
                        self.objects.push(obj);
                    }
                    self.cur_key = cur_key;
                    self.cur_value = cur_value;

                    self.slot_idx += 1;
                    return true;
                }

                self.slot_idx = 0;
                self.group_idx += 1;
                self.group = None;
            }

            self.group_idx = 0;
            self.group = None;
            self.next_table();
        }
        false
    }

    fn next_table(&mut self)
    {
        self.dir_idx += 1;
        self.tab = None;
    }

    /// Load the table at `dir_idx` into `tab`.
    fn load_current_table<W: Write>(&mut self, scope: &RefWalker<'_, W>) -> Result<()>
    {
        let bad = |msg: &str| Error::MalformedRuntime(msg.to_string());
        let dir_ptr = self.dir_ptr.as_ref().ok_or_else(|| bad("could not load one of the tables"))?;
        let (elem, stride) = match &dir_ptr.typ.kind {
            TypeKind::Array { elem, stride, .. } => (elem.clone(), *stride),
            _ => return Err(bad("could not load one of the tables")),
        };
        let slot = dir_ptr.element(self.dir_idx, &elem, stride);
        let tab = scope
            .dereference(&slot)
            .ok_or_else(|| bad("could not load one of the tables"))?;
        self.size += tab.size;
        self.count += tab.count;
        self.objects.push(tab.clone());

        let index_field = self.table_field_index.as_ref().unwrap();
        let index = tab.to_field(index_field).read_int()?;

        let groups_composite = tab.to_field(self.table_field_groups.as_ref().unwrap());
        let mut groups = groups_composite.to_field(self.groups_field_data.as_ref().unwrap());
        let length_mask = groups_composite
            .to_field(self.groups_field_length_mask.as_ref().unwrap())
            .read_uint()?;

        // convert *group into *[lengthMask+1]group so indexing is uniform
        let group_type = self.group_type.as_ref().unwrap();
        groups.typ = pointer_to(&fake_array_type(length_mask + 1, group_type));
        let groups = scope
            .dereference(&groups)
            .ok_or_else(|| bad("bad swiss map, groups pointer is nil"))?;
        self.size += groups.size;
        self.count += groups.count;
        self.objects.push(groups.clone());

        self.tab = Some(SwissTable { index, groups });
        Ok(())
    }

    /// Load the group at `group_idx` of the current table.
    fn load_current_group(&mut self) -> Result<()>
    {
        let tab = self
            .tab
            .as_ref()
            .ok_or_else(|| Error::MalformedRuntime("could not load swiss map group".to_string()))?;
        let (elem, stride) = match &tab.groups.typ.kind {
            TypeKind::Array { elem, stride, .. } => (elem.clone(), *stride),
            _ => return Err(Error::MalformedRuntime("could not load swiss map group".to_string())),
        };
        let group = tab.groups.element(self.group_idx, &elem, stride);
        let slots = group.to_field(self.group_field_slots.as_ref().unwrap());
        let ctrl = group.to_field(self.group_field_ctrl.as_ref().unwrap());
        let mut ctrls = vec![0u8; ctrl.typ.size.max(0) as usize];
        let got = ctrl.mem.read_memory(ctrl.addr.value(), &mut ctrls)?;
        if got < ctrls.len() {
            return Err(Error::ShortRead {
                addr: ctrl.addr.value(),
                wanted: ctrls.len(),
                got,
            });
        }
        self.group = Some(SwissGroup { slots, ctrls });
        Ok(())
    }

    fn slot_is_empty_or_deleted(&self, k: i64) -> bool
    {
        let Some(group) = &self.group else {
            return true;
        };
        group
            .ctrls
            .get(k as usize)
            .is_none_or(|ctrl| ctrl & SWISS_CTRL_EMPTY == SWISS_CTRL_EMPTY)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_swiss_ctrl_sentinel()
    {
        assert_eq!(SWISS_CTRL_EMPTY, 0b1000_0000);
        // a full slot has the high bit clear
        assert_eq!(0x23u8 & SWISS_CTRL_EMPTY, 0);
        // empty and deleted both carry it
        assert_eq!(0x80u8 & SWISS_CTRL_EMPTY, SWISS_CTRL_EMPTY);
        assert_eq!(0xfeu8 & SWISS_CTRL_EMPTY, SWISS_CTRL_EMPTY);
    }

    #[test]
    fn test_classic_sentinel_defaults()
    {
        // pre-1.12: the second empty sentinel coincides with the first
        assert_eq!(HASH_TOPHASH_EMPTY_ZERO, 0);
        assert_eq!(HASH_MIN_TOP_HASH_GO111, 4);
        assert_eq!(HASH_TOPHASH_EMPTY_ONE, 1);
        assert_eq!(HASH_MIN_TOP_HASH_GO112, 5);
    }
}
