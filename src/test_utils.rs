// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

//! Builders for synthetic NTFS volumes used by the tests and benchmarks.

use std::collections::BTreeMap;
use std::env;

use crate::api::*;

pub const TEST_CLUSTER_SIZE: u64 = 4096;
pub const TEST_RECORD_SIZE: usize = 1024;
pub const TEST_INDEX_RECORD_SIZE: usize = 4096;
pub const FIRST_USER_RECORD: u64 = 24;

const MFT_LCN: u64 = 4;
const MFT_FIRST_RUN_CLUSTERS: u64 = 8;
const RECORDS_PER_CLUSTER: u64 = TEST_CLUSTER_SIZE / TEST_RECORD_SIZE as u64;
const SEQUENCE: u64 = 1 << 48;
const IN_USE: u16 = NtfsFileFlags::InUse as u16;
const IS_DIRECTORY: u16 = NtfsFileFlags::IsDirectory as u16;

// Return the volume to use for tests against a real device, e.g. "R:".
// If the CI environment variable is present, prefer the current
// working directory's drive; otherwise fall back to the ramdisk 'R:'.
pub fn test_volume_letter() -> String {
    if env::var_os("CI").is_some() {
        if let Ok(cwd) = env::current_dir() {
            let s = cwd.display().to_string();
            if let Some(drive) = s.get(..2).filter(|d| d.ends_with(':')) {
                return drive.to_string();
            }
        }
    }

    "R:".to_string()
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn put<const N: usize>(buf: &mut [u8], offset: usize, bytes: [u8; N]) {
    buf[offset..offset + N].copy_from_slice(&bytes);
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Writes the update sequence array at `usa_offset` and stamps `usn` over
/// every sector tail, the way NTFS protects FILE and INDX records on disk.
pub fn protect_record(data: &mut [u8], usa_offset: usize, usn: u16) {
    let sectors = data.len() / SECTOR_SIZE;
    put(data, 4, (usa_offset as u16).to_le_bytes());
    put(data, 6, ((sectors + 1) as u16).to_le_bytes());
    put(data, usa_offset, usn.to_le_bytes());

    for sector in 0..sectors {
        let tail = (sector + 1) * SECTOR_SIZE - 2;
        let slot = usa_offset + 2 + sector * 2;
        let original = [data[tail], data[tail + 1]];
        data[slot..slot + 2].copy_from_slice(&original);
        put(data, tail, usn.to_le_bytes());
    }
}

/// A `$FILE_NAME` value, also used as the key of directory index entries.
pub fn file_name_value(
    parent: u64,
    name: &str,
    namespace: NtfsFileNamespace,
    is_dir: bool,
) -> Vec<u8> {
    let name_bytes = utf16(name);
    let mut value = vec![0u8; FILE_NAME_HEADER_SIZE];
    put(&mut value, 0, (parent | SEQUENCE).to_le_bytes());
    if is_dir {
        put(&mut value, 56, (NtfsFileNameFlags::IsDirectory as u32).to_le_bytes());
    }
    value[64] = (name_bytes.len() / 2) as u8;
    value[65] = namespace as u8;
    value.extend_from_slice(&name_bytes);
    value
}

/// Mapping pairs for `(lcn, clusters)` runs, `None` marking a sparse run.
pub fn encode_runs(runs: &[(Option<u64>, u64)]) -> Vec<u8> {
    fn unsigned_len(v: u64) -> usize {
        (1..8).find(|n| v < 1u64 << (8 * n)).unwrap_or(8)
    }
    fn signed_len(v: i64) -> usize {
        (1..8)
            .find(|n| {
                let half = 1i64 << (8 * n - 1);
                -half <= v && v < half
            })
            .unwrap_or(8)
    }

    let mut out = Vec::new();
    let mut prev_lcn = 0i64;
    for &(lcn, clusters) in runs {
        let count_len = unsigned_len(clusters);
        let (offset_len, delta) = match lcn {
            Some(lcn) => {
                let delta = lcn as i64 - prev_lcn;
                prev_lcn = lcn as i64;
                (signed_len(delta), delta)
            }
            None => (0, 0),
        };
        out.push(((offset_len << 4) | count_len) as u8);
        out.extend_from_slice(&clusters.to_le_bytes()[..count_len]);
        out.extend_from_slice(&delta.to_le_bytes()[..offset_len]);
    }
    out.push(0);
    out
}

pub struct NonResidentAttr {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub runs: Vec<u8>,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    pub flags: u16,
}

/// Assembles a single FILE record attribute by attribute.
pub struct RecordWriter {
    number: u64,
    flags: u16,
    base_reference: u64,
    attributes: Vec<u8>,
    next_id: u16,
    sequence: u16,
}

impl RecordWriter {
    pub fn new(number: u64, flags: u16, base_reference: u64) -> Self {
        RecordWriter {
            number,
            flags,
            base_reference,
            attributes: Vec::new(),
            next_id: 0,
            sequence: 1,
        }
    }

    pub fn sequence(&mut self, sequence: u16) -> &mut Self {
        self.sequence = sequence;
        self
    }

    fn push(&mut self, attr: Vec<u8>) -> &mut Self {
        self.attributes.extend_from_slice(&attr);
        self.next_id += 1;
        self
    }

    pub fn resident(
        &mut self,
        attribute_type: NtfsAttributeType,
        name: &str,
        value: &[u8],
    ) -> &mut Self {
        let name = utf16(name);
        let name_offset = RESIDENT_HEADER_SIZE + 1;
        let value_offset = align8(name_offset + name.len());
        let length = align8(value_offset + value.len());

        let mut attr = vec![0u8; length];
        put(&mut attr, 0, (attribute_type as u32).to_le_bytes());
        put(&mut attr, 4, (length as u32).to_le_bytes());
        attr[9] = (name.len() / 2) as u8;
        put(&mut attr, 10, (name_offset as u16).to_le_bytes());
        put(&mut attr, 14, self.next_id.to_le_bytes());
        put(&mut attr, 16, (value.len() as u32).to_le_bytes());
        put(&mut attr, 20, (value_offset as u16).to_le_bytes());
        attr[name_offset..name_offset + name.len()].copy_from_slice(&name);
        attr[value_offset..value_offset + value.len()].copy_from_slice(value);
        self.push(attr)
    }

    pub fn non_resident(
        &mut self,
        attribute_type: NtfsAttributeType,
        name: &str,
        fields: &NonResidentAttr,
    ) -> &mut Self {
        let name = utf16(name);
        let name_offset = NON_RESIDENT_HEADER_SIZE;
        let runs_offset = align8(name_offset + name.len());
        let length = align8(runs_offset + fields.runs.len());

        let mut attr = vec![0u8; length];
        put(&mut attr, 0, (attribute_type as u32).to_le_bytes());
        put(&mut attr, 4, (length as u32).to_le_bytes());
        attr[8] = 1;
        attr[9] = (name.len() / 2) as u8;
        put(&mut attr, 10, (name_offset as u16).to_le_bytes());
        put(&mut attr, 12, fields.flags.to_le_bytes());
        put(&mut attr, 14, self.next_id.to_le_bytes());
        put(&mut attr, 16, fields.lowest_vcn.to_le_bytes());
        put(&mut attr, 24, fields.highest_vcn.to_le_bytes());
        put(&mut attr, 32, (runs_offset as u16).to_le_bytes());
        put(&mut attr, 40, fields.allocated_size.to_le_bytes());
        put(&mut attr, 48, fields.data_size.to_le_bytes());
        put(&mut attr, 56, fields.initialized_size.to_le_bytes());
        attr[name_offset..name_offset + name.len()].copy_from_slice(&name);
        attr[runs_offset..runs_offset + fields.runs.len()].copy_from_slice(&fields.runs);
        self.push(attr)
    }

    /// Times in on-disk order: created, modified, MFT modified, accessed.
    pub fn standard_information(&mut self, times: [u64; 4]) -> &mut Self {
        let mut value = vec![0u8; 48];
        for (i, time) in times.iter().enumerate() {
            put(&mut value, i * 8, time.to_le_bytes());
        }
        put(&mut value, 32, 0x20u32.to_le_bytes());
        self.resident(NtfsAttributeType::StandardInformation, "", &value)
    }

    pub fn file_name(
        &mut self,
        parent: u64,
        name: &str,
        namespace: NtfsFileNamespace,
        is_dir: bool,
    ) -> &mut Self {
        let value = file_name_value(parent, name, namespace, is_dir);
        self.resident(NtfsAttributeType::FileName, "", &value)
    }

    pub fn finish(&self) -> Vec<u8> {
        const USA_OFFSET: usize = 0x30;
        const ATTRIBUTES_OFFSET: usize = 0x38;

        let used = ATTRIBUTES_OFFSET + self.attributes.len() + 8;
        assert!(
            used <= TEST_RECORD_SIZE,
            "record {} overflows ({used} bytes)",
            self.number
        );

        let mut data = vec![0u8; TEST_RECORD_SIZE];
        data[..4].copy_from_slice(FILE_RECORD_SIGNATURE);
        put(&mut data, 16, self.sequence.to_le_bytes());
        put(&mut data, 18, 1u16.to_le_bytes());
        put(&mut data, 20, (ATTRIBUTES_OFFSET as u16).to_le_bytes());
        put(&mut data, 22, self.flags.to_le_bytes());
        put(&mut data, 24, (used as u32).to_le_bytes());
        put(&mut data, 28, (TEST_RECORD_SIZE as u32).to_le_bytes());
        put(&mut data, 32, self.base_reference.to_le_bytes());
        put(&mut data, 40, self.next_id.to_le_bytes());
        put(&mut data, 44, (self.number as u32).to_le_bytes());

        let end = ATTRIBUTES_OFFSET + self.attributes.len();
        data[ATTRIBUTES_OFFSET..end].copy_from_slice(&self.attributes);
        data[end..end + 4].copy_from_slice(&END_MARKER);

        protect_record(&mut data, USA_OFFSET, (self.number % 0xFF) as u16 + 1);
        data
    }
}

fn entry_for_key(reference: u64, key: &[u8], subnode: Option<u64>) -> Vec<u8> {
    let mut length = align8(INDEX_ENTRY_HEADER_SIZE + key.len());
    if subnode.is_some() {
        length += 8;
    }

    let mut entry = vec![0u8; length];
    put(&mut entry, 0, reference.to_le_bytes());
    put(&mut entry, 8, (length as u16).to_le_bytes());
    put(&mut entry, 10, (key.len() as u16).to_le_bytes());
    let mut flags = 0u16;
    if let Some(vcn) = subnode {
        flags |= NtfsIndexEntryFlags::HasSubnode as u16;
        put(&mut entry, length - 8, vcn.to_le_bytes());
    }
    put(&mut entry, 12, flags.to_le_bytes());
    entry[INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + key.len()].copy_from_slice(key);
    entry
}

/// Index entry for a Win32 name.
pub fn index_entry(
    record: u64,
    parent: u64,
    name: &str,
    is_dir: bool,
    subnode: Option<u64>,
) -> Vec<u8> {
    let key = file_name_value(parent, name, NtfsFileNamespace::Win32, is_dir);
    entry_for_key(record | SEQUENCE, &key, subnode)
}

/// Terminating entry of an index node.
pub fn last_entry(subnode: Option<u64>) -> Vec<u8> {
    let mut entry = entry_for_key(0, &[], subnode);
    let flags = u16::from_le_bytes([entry[12], entry[13]]) | NtfsIndexEntryFlags::Last as u16;
    put(&mut entry, 12, flags.to_le_bytes());
    entry
}

/// Node header followed by `entries`.
pub fn index_node(entries: &[Vec<u8>], has_subnodes: bool) -> Vec<u8> {
    let length = INDEX_NODE_HEADER_SIZE + entries.iter().map(Vec::len).sum::<usize>();
    let mut node = vec![0u8; INDEX_NODE_HEADER_SIZE];
    put(&mut node, 0, (INDEX_NODE_HEADER_SIZE as u32).to_le_bytes());
    put(&mut node, 4, (length as u32).to_le_bytes());
    put(&mut node, 8, (length as u32).to_le_bytes());
    node[12] = has_subnodes as u8;
    for entry in entries {
        node.extend_from_slice(entry);
    }
    node
}

fn index_root_value(entries: &[Vec<u8>], has_subnodes: bool) -> Vec<u8> {
    let mut value = vec![0u8; INDEX_ROOT_HEADER_SIZE];
    put(&mut value, 0, (NtfsAttributeType::FileName as u32).to_le_bytes());
    put(&mut value, 4, 1u32.to_le_bytes());
    put(&mut value, 8, (TEST_INDEX_RECORD_SIZE as u32).to_le_bytes());
    value[12] = 1;
    value.extend(index_node(entries, has_subnodes));
    value
}

/// A protected INDX block holding `entries` at `vcn`.
pub fn index_block(vcn: u64, entries: &[Vec<u8>]) -> Vec<u8> {
    const USA_OFFSET: usize = 0x28;
    const ENTRIES_START: usize = 0x40;

    let mut block = vec![0u8; TEST_INDEX_RECORD_SIZE];
    block[..4].copy_from_slice(INDEX_RECORD_SIGNATURE);
    put(&mut block, 16, vcn.to_le_bytes());

    let mut offset = ENTRIES_START;
    for entry in entries {
        block[offset..offset + entry.len()].copy_from_slice(entry);
        offset += entry.len();
    }
    let node = INDEX_RECORD_HEADER_SIZE;
    put(&mut block, node, ((ENTRIES_START - node) as u32).to_le_bytes());
    put(&mut block, node + 4, ((offset - node) as u32).to_le_bytes());
    put(
        &mut block,
        node + 8,
        ((TEST_INDEX_RECORD_SIZE - node) as u32).to_le_bytes(),
    );

    protect_record(&mut block, USA_OFFSET, (vcn % 0xFF) as u16 + 1);
    block
}

fn attribute_list_entry(
    attribute_type: NtfsAttributeType,
    lowest_vcn: u64,
    record: u64,
    id: u16,
) -> Vec<u8> {
    let mut entry = vec![0u8; align8(ATTRIBUTE_LIST_ENTRY_SIZE)];
    put(&mut entry, 0, (attribute_type as u32).to_le_bytes());
    let length = entry.len() as u16;
    put(&mut entry, 4, length.to_le_bytes());
    entry[7] = ATTRIBUTE_LIST_ENTRY_SIZE as u8;
    put(&mut entry, 8, lowest_vcn.to_le_bytes());
    put(&mut entry, 16, (record | SEQUENCE).to_le_bytes());
    put(&mut entry, 24, id.to_le_bytes());
    entry
}

#[derive(Clone, Debug)]
pub enum Fragment {
    /// Allocated clusters holding these bytes, zero padded to a cluster.
    Data(Vec<u8>),
    /// Unallocated clusters.
    Sparse(u64),
}

#[derive(Clone, Debug)]
pub enum StreamData {
    Resident(Vec<u8>),
    NonResident {
        fragments: Vec<Fragment>,
        /// Valid data length, defaults to the stream size.
        initialized_size: Option<u64>,
    },
}

fn clusters_for(len: usize) -> u64 {
    (len as u64).div_ceil(TEST_CLUSTER_SIZE).max(1)
}

impl StreamData {
    pub fn non_resident(fragments: Vec<Fragment>) -> Self {
        StreamData::NonResident {
            fragments,
            initialized_size: None,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            StreamData::Resident(data) => data.len() as u64,
            StreamData::NonResident { fragments, .. } => {
                let last = fragments.len().saturating_sub(1);
                fragments
                    .iter()
                    .enumerate()
                    .map(|(i, fragment)| match fragment {
                        Fragment::Data(data) if i == last => data.len() as u64,
                        Fragment::Data(data) => clusters_for(data.len()) * TEST_CLUSTER_SIZE,
                        Fragment::Sparse(clusters) => clusters * TEST_CLUSTER_SIZE,
                    })
                    .sum()
            }
        }
    }

    fn initialized_size(&self) -> u64 {
        match self {
            StreamData::NonResident {
                initialized_size: Some(initialized),
                ..
            } => (*initialized).min(self.size()),
            _ => self.size(),
        }
    }

    /// The bytes a correct reader returns for this stream.
    pub fn logical_bytes(&self) -> Vec<u8> {
        let fragments = match self {
            StreamData::Resident(data) => return data.clone(),
            StreamData::NonResident { fragments, .. } => fragments,
        };

        let mut out = Vec::new();
        for fragment in fragments {
            match fragment {
                Fragment::Data(data) => {
                    out.extend_from_slice(data);
                    let padded = (clusters_for(data.len()) * TEST_CLUSTER_SIZE) as usize;
                    out.resize(out.len() + padded - data.len(), 0);
                }
                Fragment::Sparse(clusters) => {
                    out.resize(out.len() + (clusters * TEST_CLUSTER_SIZE) as usize, 0);
                }
            }
        }
        out.truncate(self.size() as usize);
        let initialized = self.initialized_size() as usize;
        out[initialized..].fill(0);
        out
    }
}

/// Default timestamps of a record: created, modified, MFT modified, accessed.
pub fn default_times(number: u64) -> [u64; 4] {
    // 2020-01-01T00:00:00Z
    const BASE: u64 = EPOCH_DIFFERENCE + 1_577_836_800 * 10_000_000;
    const HOUR: u64 = 3_600 * 10_000_000;

    let created = BASE + number * HOUR + 1_234_567;
    [
        created,
        created + 24 * HOUR + 10,
        created + 48 * HOUR + 20,
        created + 72 * HOUR + 30,
    ]
}

struct Node {
    parent: u64,
    name: String,
    is_dir: bool,
    times: [u64; 4],
    streams: Vec<(String, StreamData)>,
    dos_alias: Option<String>,
    large_index: bool,
    compressed: bool,
    split: Option<(u64, u64)>,
    reused: bool,
}

struct Disk {
    next_lcn: u64,
    writes: Vec<(u64, Vec<u8>)>,
}

impl Disk {
    fn allocate(&mut self, clusters: u64) -> u64 {
        let lcn = self.next_lcn;
        self.next_lcn += clusters;
        lcn
    }

    /// Data fragments are laid out back to front with a gap between them, so
    /// consecutive runs move backwards on disk.
    fn place(&mut self, fragments: &[Fragment]) -> Vec<(Option<u64>, u64)> {
        let data: Vec<&Vec<u8>> = fragments
            .iter()
            .filter_map(|fragment| match fragment {
                Fragment::Data(data) => Some(data),
                Fragment::Sparse(_) => None,
            })
            .collect();

        let mut lcns = vec![0u64; data.len()];
        for i in (0..data.len()).rev() {
            lcns[i] = self.allocate(clusters_for(data[i].len()));
            self.next_lcn += 1;
        }

        let mut runs = Vec::with_capacity(fragments.len());
        let mut next = 0;
        for fragment in fragments {
            match fragment {
                Fragment::Data(bytes) => {
                    let lcn = lcns[next];
                    next += 1;
                    self.writes.push((lcn * TEST_CLUSTER_SIZE, bytes.clone()));
                    runs.push((Some(lcn), clusters_for(bytes.len())));
                }
                Fragment::Sparse(clusters) => runs.push((None, *clusters)),
            }
        }
        runs
    }
}

struct IndexKey {
    sort: String,
    reference: u64,
    value: Vec<u8>,
}

/// Builds a small but structurally faithful NTFS volume in memory.
///
/// Clusters are 4 KiB, file records 1 KiB, and the `$MFT` data is split in
/// two runs so records from 32 on live in a second extent.
pub struct ImageBuilder {
    nodes: BTreeMap<u64, Node>,
    next_record: u64,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_RECORD,
            Node {
                parent: ROOT_RECORD,
                name: ".".to_string(),
                is_dir: true,
                times: default_times(ROOT_RECORD),
                streams: Vec::new(),
                dos_alias: None,
                large_index: false,
                compressed: false,
                split: None,
                reused: false,
            },
        );

        ImageBuilder {
            nodes,
            next_record: FIRST_USER_RECORD,
        }
    }

    fn add(
        &mut self,
        parent: u64,
        name: &str,
        is_dir: bool,
        streams: Vec<(String, StreamData)>,
    ) -> u64 {
        assert!(
            self.nodes.get(&parent).is_some_and(|node| node.is_dir),
            "parent {parent} is not a directory"
        );
        let number = self.next_record;
        self.next_record += 1;
        self.nodes.insert(
            number,
            Node {
                parent,
                name: name.to_string(),
                is_dir,
                times: default_times(number),
                streams,
                dos_alias: None,
                large_index: false,
                compressed: false,
                split: None,
                reused: false,
            },
        );
        number
    }

    fn node_mut(&mut self, record: u64) -> &mut Node {
        self.nodes
            .get_mut(&record)
            .unwrap_or_else(|| panic!("no record {record}"))
    }

    pub fn add_directory(&mut self, parent: u64, name: &str) -> u64 {
        self.add(parent, name, true, Vec::new())
    }

    pub fn add_file(&mut self, parent: u64, name: &str, data: StreamData) -> u64 {
        self.add(parent, name, false, vec![(String::new(), data)])
    }

    /// Adds a named alternate data stream.
    pub fn add_stream(&mut self, record: u64, name: &str, data: StreamData) {
        self.node_mut(record).streams.push((name.to_string(), data));
    }

    pub fn dos_alias(&mut self, record: u64, alias: &str) {
        self.node_mut(record).dos_alias = Some(alias.to_string());
    }

    /// Forces the directory index into `$INDEX_ALLOCATION` blocks.
    pub fn large_index(&mut self, dir: u64) {
        self.node_mut(dir).large_index = true;
    }

    /// Flags the non-resident data streams of `record` as compressed.
    pub fn mark_compressed(&mut self, record: u64) {
        self.node_mut(record).compressed = true;
    }

    /// Bumps the sequence number of `record` as if it had been freed and
    /// allocated again, leaving its parent's index entry stale.
    pub fn reuse_record(&mut self, record: u64) {
        self.node_mut(record).reused = true;
    }

    /// Moves the default data stream into two extension records reached
    /// through an `$ATTRIBUTE_LIST`. The segment starting at VCN 0 goes to
    /// the higher record number.
    pub fn split_data(&mut self, record: u64) -> (u64, u64) {
        let extensions = (self.next_record, self.next_record + 1);
        self.next_record += 2;
        self.node_mut(record).split = Some(extensions);
        extensions
    }

    pub fn build(&self) -> Vec<u8> {
        let mut disk = Disk {
            next_lcn: MFT_LCN + MFT_FIRST_RUN_CLUSTERS,
            writes: Vec::new(),
        };
        let mut records: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        for (&number, node) in &self.nodes {
            let flags = if node.is_dir {
                IN_USE | IS_DIRECTORY
            } else {
                IN_USE
            };
            let mut writer = RecordWriter::new(number, flags, 0);
            if node.reused {
                writer.sequence(2);
            }
            writer.standard_information(node.times);
            writer.file_name(node.parent, &node.name, NtfsFileNamespace::Win32, node.is_dir);
            if let Some(alias) = &node.dos_alias {
                writer.file_name(node.parent, alias, NtfsFileNamespace::Dos, node.is_dir);
            }
            if node.is_dir {
                self.write_index(number, &mut writer, &mut disk);
            }

            for (name, data) in &node.streams {
                let fragments = match data {
                    StreamData::Resident(value) => {
                        writer.resident(NtfsAttributeType::Data, name, value);
                        continue;
                    }
                    StreamData::NonResident { fragments, .. } => fragments,
                };

                let runs = disk.place(fragments);
                let flags = if node.compressed { 0x0001 } else { 0 };
                match node.split {
                    Some((low, high)) if name.is_empty() => {
                        assert!(runs.len() >= 2, "split needs at least two runs");
                        let (first, second) = runs.split_at(runs.len() / 2);
                        let first_clusters: u64 = first.iter().map(|r| r.1).sum();
                        let total: u64 = runs.iter().map(|r| r.1).sum();

                        let mut head = RecordWriter::new(high, IN_USE, number | SEQUENCE);
                        head.non_resident(
                            NtfsAttributeType::Data,
                            "",
                            &NonResidentAttr {
                                lowest_vcn: 0,
                                highest_vcn: first_clusters - 1,
                                runs: encode_runs(first),
                                allocated_size: total * TEST_CLUSTER_SIZE,
                                data_size: data.size(),
                                initialized_size: data.initialized_size(),
                                flags,
                            },
                        );
                        let mut tail = RecordWriter::new(low, IN_USE, number | SEQUENCE);
                        tail.non_resident(
                            NtfsAttributeType::Data,
                            "",
                            &NonResidentAttr {
                                lowest_vcn: first_clusters,
                                highest_vcn: total - 1,
                                runs: encode_runs(second),
                                allocated_size: 0,
                                data_size: 0,
                                initialized_size: 0,
                                flags,
                            },
                        );
                        records.insert(high, head.finish());
                        records.insert(low, tail.finish());

                        let mut list = Vec::new();
                        list.extend(attribute_list_entry(
                            NtfsAttributeType::StandardInformation,
                            0,
                            number,
                            0,
                        ));
                        list.extend(attribute_list_entry(
                            NtfsAttributeType::FileName,
                            0,
                            number,
                            1,
                        ));
                        list.extend(attribute_list_entry(NtfsAttributeType::Data, 0, high, 0));
                        list.extend(attribute_list_entry(
                            NtfsAttributeType::Data,
                            first_clusters,
                            low,
                            0,
                        ));
                        writer.resident(NtfsAttributeType::AttributeList, "", &list);
                    }
                    _ => {
                        let total: u64 = runs.iter().map(|r| r.1).sum();
                        writer.non_resident(
                            NtfsAttributeType::Data,
                            name,
                            &NonResidentAttr {
                                lowest_vcn: 0,
                                highest_vcn: total.saturating_sub(1),
                                runs: encode_runs(&runs),
                                allocated_size: total * TEST_CLUSTER_SIZE,
                                data_size: data.size(),
                                initialized_size: data.initialized_size(),
                                flags,
                            },
                        );
                    }
                }
            }

            records.insert(number, writer.finish());
        }

        let needed = self
            .next_record
            .saturating_sub(MFT_FIRST_RUN_CLUSTERS * RECORDS_PER_CLUSTER);
        let second_clusters = needed.div_ceil(RECORDS_PER_CLUSTER).max(2);
        let second_lcn = disk.allocate(second_clusters);
        let total_records = (MFT_FIRST_RUN_CLUSTERS + second_clusters) * RECORDS_PER_CLUSTER;
        let mft_size = total_records * TEST_RECORD_SIZE as u64;

        let mut mft = RecordWriter::new(MFT_RECORD, IN_USE, 0);
        mft.standard_information(default_times(MFT_RECORD));
        mft.file_name(ROOT_RECORD, "$MFT", NtfsFileNamespace::Win32AndDos, false);
        mft.non_resident(
            NtfsAttributeType::Data,
            "",
            &NonResidentAttr {
                lowest_vcn: 0,
                highest_vcn: MFT_FIRST_RUN_CLUSTERS + second_clusters - 1,
                runs: encode_runs(&[
                    (Some(MFT_LCN), MFT_FIRST_RUN_CLUSTERS),
                    (Some(second_lcn), second_clusters),
                ]),
                allocated_size: mft_size,
                data_size: mft_size,
                initialized_size: mft_size,
                flags: 0,
            },
        );
        records.insert(MFT_RECORD, mft.finish());

        let first_run_records = MFT_FIRST_RUN_CLUSTERS * RECORDS_PER_CLUSTER;
        for (number, data) in records {
            let position = if number < first_run_records {
                MFT_LCN * TEST_CLUSTER_SIZE + number * TEST_RECORD_SIZE as u64
            } else {
                second_lcn * TEST_CLUSTER_SIZE
                    + (number - first_run_records) * TEST_RECORD_SIZE as u64
            };
            disk.writes.push((position, data));
        }

        let total_clusters = disk.next_lcn + 1;
        let mut image = vec![0u8; (total_clusters * TEST_CLUSTER_SIZE) as usize];
        image[..SECTOR_SIZE].copy_from_slice(&boot_sector(total_clusters * 8));
        for (position, data) in disk.writes {
            let start = position as usize;
            image[start..start + data.len()].copy_from_slice(&data);
        }
        image
    }

    fn write_index(&self, dir: u64, writer: &mut RecordWriter, disk: &mut Disk) {
        let mut keys = Vec::new();
        for (&number, node) in &self.nodes {
            if number == dir || node.parent != dir {
                continue;
            }
            keys.push(IndexKey {
                sort: node.name.to_uppercase(),
                reference: number | SEQUENCE,
                value: file_name_value(dir, &node.name, NtfsFileNamespace::Win32, node.is_dir),
            });
            if let Some(alias) = &node.dos_alias {
                keys.push(IndexKey {
                    sort: alias.to_uppercase(),
                    reference: number | SEQUENCE,
                    value: file_name_value(dir, alias, NtfsFileNamespace::Dos, node.is_dir),
                });
            }
        }
        keys.sort_by(|a, b| a.sort.cmp(&b.sort));

        let leaf = |key: &IndexKey| entry_for_key(key.reference, &key.value, None);
        let body: usize = keys.iter().map(|key| leaf(key).len()).sum();

        if !self.nodes[&dir].large_index && body <= 512 {
            let mut entries: Vec<Vec<u8>> = keys.iter().map(leaf).collect();
            entries.push(last_entry(None));
            writer.resident(
                NtfsAttributeType::IndexRoot,
                FILE_NAME_INDEX,
                &index_root_value(&entries, false),
            );
            return;
        }

        // Fill blocks in key order, leaving room for the terminating entry.
        const BLOCK_BUDGET: usize = TEST_INDEX_RECORD_SIZE - 0x40 - 64;
        let mut chunks: Vec<Vec<IndexKey>> = vec![Vec::new()];
        let mut used = 0;
        for key in keys {
            let len = leaf(&key).len();
            if used + len > BLOCK_BUDGET {
                chunks.push(Vec::new());
                used = 0;
            }
            used += len;
            if let Some(chunk) = chunks.last_mut() {
                chunk.push(key);
            }
        }

        let blocks = chunks.len() as u64;
        let first_lcn = disk.allocate(blocks);
        let mut root_entries = Vec::new();
        for (vcn, mut chunk) in chunks.into_iter().enumerate() {
            let vcn = vcn as u64;
            // Every block but the last hands its greatest key up as separator.
            let separator = if vcn + 1 < blocks { chunk.pop() } else { None };

            let mut entries: Vec<Vec<u8>> = chunk.iter().map(leaf).collect();
            entries.push(last_entry(None));
            disk.writes.push((
                (first_lcn + vcn) * TEST_CLUSTER_SIZE,
                index_block(vcn, &entries),
            ));

            match separator {
                Some(key) => {
                    root_entries.push(entry_for_key(key.reference, &key.value, Some(vcn)))
                }
                None => root_entries.push(last_entry(Some(vcn))),
            }
        }

        writer.resident(
            NtfsAttributeType::IndexRoot,
            FILE_NAME_INDEX,
            &index_root_value(&root_entries, true),
        );
        let size = blocks * TEST_CLUSTER_SIZE;
        writer.non_resident(
            NtfsAttributeType::IndexAllocation,
            FILE_NAME_INDEX,
            &NonResidentAttr {
                lowest_vcn: 0,
                highest_vcn: blocks - 1,
                runs: encode_runs(&[(Some(first_lcn), blocks)]),
                allocated_size: size,
                data_size: size,
                initialized_size: size,
                flags: 0,
            },
        );
    }
}

fn boot_sector(total_sectors: u64) -> Vec<u8> {
    let mut boot = vec![0u8; SECTOR_SIZE];
    boot[..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    boot[3..11].copy_from_slice(NTFS_OEM_ID);
    put(&mut boot, 11, (SECTOR_SIZE as u16).to_le_bytes());
    boot[13] = (TEST_CLUSTER_SIZE / SECTOR_SIZE as u64) as u8;
    boot[21] = 0xF8;
    put(&mut boot, 40, total_sectors.to_le_bytes());
    put(&mut boot, 48, MFT_LCN.to_le_bytes());
    put(&mut boot, 56, 2u64.to_le_bytes());
    boot[64] = -10i8 as u8;
    boot[68] = 1;
    put(&mut boot, 72, 0x1234_5678_9ABC_DEF0u64.to_le_bytes());
    put(&mut boot, 510, 0xAA55u16.to_le_bytes());
    boot
}
