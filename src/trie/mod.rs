//! RefCountTrie - reference counting prefix tree
//!
//! Keys are strings; every key carries the number of times it was added.
//! The trie guards itself with an internal `RwLock`, so a shared reference
//! is enough for every operation.
//!
//! Dump file format (bincode):
//! ```text
//! TrieFile { version: u32, members: Vec<Member> }   // members in key order
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrisError};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<char, Node>,
    count: i64,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.count == 0 && self.children.is_empty()
    }

    fn find(&self, key: &str) -> Option<&Node> {
        let mut node = self;
        for c in key.chars() {
            node = node.children.get(&c)?;
        }
        Some(node)
    }

    fn collect(&self, prefix: &mut String, out: &mut Vec<Member>) {
        if self.count > 0 {
            out.push(Member { value: prefix.clone(), count: self.count });
        }
        for (c, child) in &self.children {
            prefix.push(*c);
            child.collect(prefix, out);
            prefix.pop();
        }
    }

    fn dump(&self, depth: usize, out: &mut String) {
        for (c, child) in &self.children {
            out.push_str(&" ".repeat(depth + 1));
            out.push(*c);
            if child.count > 0 {
                out.push_str(&format!(" ({})", child.count));
            }
            out.push('\n');
            child.dump(depth + 1, out);
        }
    }
}

/// Returns whether the key held a count; prunes emptied branches.
fn remove(node: &mut Node, key: &[char]) -> bool {
    match key.split_first() {
        None => {
            let existed = node.count > 0;
            node.count = 0;
            existed
        }
        Some((c, rest)) => {
            let Some(child) = node.children.get_mut(c) else {
                return false;
            };
            let existed = remove(child, rest);
            if child.is_empty() {
                node.children.remove(c);
            }
            existed
        }
    }
}

/// A key and its reference count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub value: String,
    pub count: i64,
}

#[derive(Serialize, Deserialize)]
struct TrieFile {
    version: u32,
    members: Vec<Member>,
}

#[derive(Debug, Default)]
pub struct RefCountTrie {
    root: RwLock<Node>,
}

impl RefCountTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference to `key`, returning the new count.
    pub fn add(&self, key: &str) -> i64 {
        self.add_count(key, 1)
    }

    fn add_count(&self, key: &str, count: i64) -> i64 {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for c in key.chars() {
            node = node.children.entry(c).or_default();
        }
        node.count += count;
        node.count
    }

    /// Remove `key` regardless of its count. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let chars: Vec<char> = key.chars().collect();
        remove(&mut self.root.write(), &chars)
    }

    pub fn has(&self, key: &str) -> bool {
        self.has_count(key).0
    }

    pub fn has_count(&self, key: &str) -> (bool, i64) {
        let root = self.root.read();
        match root.find(key) {
            Some(node) if node.count > 0 => (true, node.count),
            _ => (false, 0),
        }
    }

    /// Whether any key starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let root = self.root.read();
        root.find(prefix).is_some_and(|node| !node.is_empty())
    }

    /// All keys in lexical order.
    pub fn members(&self) -> Vec<Member> {
        self.prefix_members("")
    }

    pub fn prefix_members(&self, prefix: &str) -> Vec<Member> {
        let root = self.root.read();
        let mut out = Vec::new();
        if let Some(node) = root.find(prefix) {
            let mut buf = prefix.to_string();
            node.collect(&mut buf, &mut out);
        }
        out
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }

    /// Human readable tree, one character per line, counts in parentheses.
    pub fn dump(&self) -> String {
        let root = self.root.read();
        let mut out = String::from("<root>\n");
        root.dump(0, &mut out);
        out
    }

    /// Write the trie to `path` through a temporary file and a rename.
    pub fn persist_to_file(&self, path: &Path) -> Result<()> {
        let file = TrieFile { version: FORMAT_VERSION, members: self.members() };
        let tmp = temp_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &file)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let trie = Self::new();
        for member in read_dump(path)? {
            trie.add_count(&member.value, member.count);
        }
        Ok(trie)
    }

    /// Add every member of the dump at `path` to this trie, summing counts.
    /// Returns the number of members merged.
    pub fn merge_from_file(&self, path: &Path) -> Result<usize> {
        let members = read_dump(path)?;
        for member in &members {
            self.add_count(&member.value, member.count);
        }
        Ok(members.len())
    }

    /// Swap in the contents of `other`.
    pub fn replace_with(&self, other: RefCountTrie) {
        *self.root.write() = other.root.into_inner();
    }
}

fn read_dump(path: &Path) -> Result<Vec<Member>> {
    let reader = BufReader::new(File::open(path)?);
    let file: TrieFile = bincode::deserialize_from(reader)?;
    if file.version != FORMAT_VERSION {
        return Err(TrisError::InvalidFormat(format!(
            "{}: unsupported dump version {}",
            path.display(),
            file.version
        )));
    }
    Ok(file.members.into_iter().filter(|m| m.count > 0).collect())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}
