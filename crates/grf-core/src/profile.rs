//! # Profile Emitter
//!
//! Builds the reference-chain profile and serializes it as a gzip-compressed pprof
//! `Profile` message. Two sample types in fixed order: `inuse_objects/count` and
//! `inuse_space/bytes`; every reference-chain name becomes one string-table entry with
//! a matching location/function pair, and samples carry `[count, bytes]` values keyed
//! by the location chain.

use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use crate::error::Result;

/// pprof protocol messages.
///
/// Hand-rolled prost definitions of the standard `perftools.profiles.Profile` schema;
/// only the fields this emitter populates carry non-default values.
pub mod proto
{
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Profile
    {
        #[prost(message, repeated, tag = "1")]
        pub sample_type: ::prost::alloc::vec::Vec<ValueType>,
        #[prost(message, repeated, tag = "2")]
        pub sample: ::prost::alloc::vec::Vec<Sample>,
        #[prost(message, repeated, tag = "3")]
        pub mapping: ::prost::alloc::vec::Vec<Mapping>,
        #[prost(message, repeated, tag = "4")]
        pub location: ::prost::alloc::vec::Vec<Location>,
        #[prost(message, repeated, tag = "5")]
        pub function: ::prost::alloc::vec::Vec<Function>,
        #[prost(string, repeated, tag = "6")]
        pub string_table: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(int64, tag = "9")]
        pub time_nanos: i64,
        #[prost(int64, tag = "10")]
        pub duration_nanos: i64,
        #[prost(message, optional, tag = "11")]
        pub period_type: ::core::option::Option<ValueType>,
        #[prost(int64, tag = "12")]
        pub period: i64,
        #[prost(int64, tag = "14")]
        pub default_sample_type: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ValueType
    {
        #[prost(int64, tag = "1")]
        pub r#type: i64,
        #[prost(int64, tag = "2")]
        pub unit: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Sample
    {
        #[prost(uint64, repeated, tag = "1")]
        pub location_id: ::prost::alloc::vec::Vec<u64>,
        #[prost(int64, repeated, tag = "2")]
        pub value: ::prost::alloc::vec::Vec<i64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Mapping
    {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(uint64, tag = "2")]
        pub memory_start: u64,
        #[prost(uint64, tag = "3")]
        pub memory_limit: u64,
        #[prost(uint64, tag = "4")]
        pub file_offset: u64,
        #[prost(int64, tag = "5")]
        pub filename: i64,
        #[prost(int64, tag = "6")]
        pub build_id: i64,
        #[prost(bool, tag = "7")]
        pub has_functions: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Location
    {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(uint64, tag = "2")]
        pub mapping_id: u64,
        #[prost(uint64, tag = "3")]
        pub address: u64,
        #[prost(message, repeated, tag = "4")]
        pub line: ::prost::alloc::vec::Vec<Line>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Line
    {
        #[prost(uint64, tag = "1")]
        pub function_id: u64,
        #[prost(int64, tag = "2")]
        pub line: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Function
    {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(int64, tag = "2")]
        pub name: i64,
        #[prost(int64, tag = "3")]
        pub system_name: i64,
        #[prost(int64, tag = "4")]
        pub filename: i64,
        #[prost(int64, tag = "5")]
        pub start_line: i64,
    }
}

/// Number of string-table entries reserved at construction: the empty string plus the
/// four sample-type names. Location and function ids start right after them.
const RESERVED_STRINGS: u64 = 5;

#[derive(Default)]
struct ProfileNode
{
    count: i64,
    size: i64,
}

/// Accumulates reference edges and writes the profile on flush.
pub struct ProfileBuilder<W: Write>
{
    writer: W,
    strings: Vec<String>,
    string_map: HashMap<String, u64>,
    // key: the sample's location chain, leaf first
    nodes: HashMap<Vec<u64>, ProfileNode>,
}

impl<W: Write> ProfileBuilder<W>
{
    pub fn new(writer: W) -> ProfileBuilder<W>
    {
        let mut pb = ProfileBuilder {
            writer,
            strings: vec![String::new()],
            string_map: HashMap::from([(String::new(), 0)]),
            nodes: HashMap::new(),
        };
        pb.string_index("inuse_objects");
        pb.string_index("count");
        pb.string_index("inuse_space");
        pb.string_index("bytes");
        pb
    }

    /// Intern `s`, returning its string-table index.
    pub fn string_index(&mut self, s: &str) -> u64
    {
        if let Some(&id) = self.string_map.get(s) {
            return id;
        }
        let id = self.strings.len() as u64;
        self.strings.push(s.to_string());
        self.string_map.insert(s.to_string(), id);
        id
    }

    /// Add `(count, bytes)` to the edge identified by its location chain.
    ///
    /// Edges for the same chain aggregate commutatively, so call order between roots
    /// does not matter.
    pub fn add_reference(&mut self, indexes: Vec<u64>, count: i64, bytes: i64)
    {
        let node = self.nodes.entry(indexes).or_default();
        node.count += count;
        node.size += bytes;
    }

    /// Serialize everything accumulated so far and close the gzip stream.
    pub fn flush(mut self) -> Result<()>
    {
        let mut profile = proto::Profile {
            sample_type: vec![
                proto::ValueType { r#type: 1, unit: 2 },
                proto::ValueType { r#type: 3, unit: 4 },
            ],
            ..Default::default()
        };

        for (indexes, node) in &self.nodes {
            profile.sample.push(proto::Sample {
                location_id: indexes.clone(),
                value: vec![node.count, node.size],
            });
        }

        // one location-and-function pair per chain name; ids equal string indexes
        for id in RESERVED_STRINGS..self.strings.len() as u64 {
            profile.location.push(proto::Location {
                id,
                line: vec![proto::Line {
                    function_id: id,
                    line: 0,
                }],
                ..Default::default()
            });
            profile.function.push(proto::Function {
                id,
                name: id as i64,
                ..Default::default()
            });
        }

        // a single sentinel mapping keeps viewer validation happy
        let filename = self.string_index("-") as i64;
        profile.mapping.push(proto::Mapping {
            id: 1,
            memory_start: 0,
            memory_limit: 0xff,
            file_offset: 0,
            filename,
            build_id: 0,
            has_functions: false,
        });
        profile.string_table = std::mem::take(&mut self.strings);

        let mut encoder = GzEncoder::new(&mut self.writer, Compression::fast());
        encoder.write_all(&profile.encode_to_vec())?;
        encoder.finish()?;
        Ok(())
    }
}

/// One node of a reference chain: an immutable cons cell threading the current chain
/// through the walker's recursion.
pub struct ChainIndex
{
    idx: u64,
    depth: usize,
    prev: Option<Rc<ChainIndex>>,
}

impl ChainIndex
{
    /// Push a new head onto `prev`.
    pub fn push(prev: &Option<Rc<ChainIndex>>, idx: u64) -> Rc<ChainIndex>
    {
        Rc::new(ChainIndex {
            idx,
            depth: prev.as_ref().map_or(0, |p| p.depth + 1),
            prev: prev.clone(),
        })
    }

    pub fn depth(&self) -> usize
    {
        self.depth
    }

    /// The chain serialized head-first (deepest name first), the order pprof expects
    /// sample locations in.
    pub fn indexes(&self) -> Vec<u64>
    {
        let mut result = Vec::with_capacity(self.depth + 1);
        let mut node = Some(self);
        while let Some(current) = node {
            result.push(current.idx);
            node = current.prev.as_deref();
        }
        result
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn decode(bytes: &[u8]) -> proto::Profile
    {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw).unwrap();
        proto::Profile::decode(raw.as_slice()).unwrap()
    }

    #[test]
    fn test_reserved_strings_and_sample_types()
    {
        let mut out = Vec::new();
        ProfileBuilder::new(&mut out).flush().unwrap();
        let profile = decode(&out);

        assert_eq!(
            &profile.string_table[..5],
            &["", "inuse_objects", "count", "inuse_space", "bytes"]
        );
        assert_eq!(profile.sample_type.len(), 2);
        assert_eq!(profile.string_table[profile.sample_type[0].r#type as usize], "inuse_objects");
        assert_eq!(profile.string_table[profile.sample_type[0].unit as usize], "count");
        assert_eq!(profile.string_table[profile.sample_type[1].r#type as usize], "inuse_space");
        assert_eq!(profile.string_table[profile.sample_type[1].unit as usize], "bytes");
        assert_eq!(profile.mapping.len(), 1);
        assert_eq!(profile.mapping[0].id, 1);
        assert_eq!(profile.mapping[0].memory_limit, 0xff);
    }

    #[test]
    fn test_edges_round_trip_through_viewer_schema()
    {
        let mut out = Vec::new();
        let mut pb = ProfileBuilder::new(&mut out);
        let root = ChainIndex::push(&None, pb.string_index("main.globalMap"));
        let key = ChainIndex::push(&Some(root.clone()), pb.string_index("$mapkey. (string)"));
        pb.add_reference(root.indexes(), 1, 48);
        pb.add_reference(key.indexes(), 3, 192);
        pb.add_reference(key.indexes(), 1, 64);
        pb.flush().unwrap();

        let profile = decode(&out);
        assert_eq!(profile.sample.len(), 2);

        // every sample's chain decodes to string-table names, and no location id
        // references an undefined function
        let location_ids: Vec<u64> = profile.location.iter().map(|loc| loc.id).collect();
        let function_ids: Vec<u64> = profile.function.iter().map(|fun| fun.id).collect();
        for sample in &profile.sample {
            assert_eq!(sample.value.len(), 2);
            for id in &sample.location_id {
                assert!(location_ids.contains(id));
                let location = profile.location.iter().find(|loc| loc.id == *id).unwrap();
                assert!(function_ids.contains(&location.line[0].function_id));
            }
        }

        let key_sample = profile
            .sample
            .iter()
            .find(|sample| sample.location_id.len() == 2)
            .unwrap();
        assert_eq!(key_sample.value, vec![4, 256]);
        // leaf-first ordering
        assert_eq!(
            profile.string_table[key_sample.location_id[0] as usize],
            "$mapkey. (string)"
        );
        assert_eq!(profile.string_table[key_sample.location_id[1] as usize], "main.globalMap");
    }

    #[test]
    fn test_chain_depth()
    {
        let a = ChainIndex::push(&None, 7);
        assert_eq!(a.depth(), 0);
        let b = ChainIndex::push(&Some(a), 9);
        assert_eq!(b.depth(), 1);
        assert_eq!(b.indexes(), vec![9, 7]);
    }
}
