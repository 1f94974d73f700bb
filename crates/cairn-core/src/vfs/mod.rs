pub mod entry;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

pub use entry::FileInfo;

/// One tree node. Nodes hold only an inode key string; the records live in
/// the filesystem's flat inode table (arena + index, no back references).
pub struct Node {
    inode_key: Mutex<String>,
    children: Mutex<BTreeMap<String, Arc<Node>>>,
}

impl Node {
    fn new() -> Arc<Node> {
        Arc::new(Node {
            inode_key: Mutex::new(String::new()),
            children: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn inode_key(&self) -> String {
        self.inode_key.lock().unwrap().clone()
    }

    fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.lock().unwrap().get(name).cloned()
    }

    fn child_or_create(&self, name: &str) -> Arc<Node> {
        let mut children = self.children.lock().unwrap();
        children.entry(name.to_string()).or_insert_with(Node::new).clone()
    }
}

/// Aggregate counts exposed to the snapshot header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub files: u64,
    pub directories: u64,
    pub total_size: u64,
}

struct PathnameTable {
    next_id: u64,
    forward: HashMap<String, u64>,
    inverse: HashMap<u64, String>,
}

/// The virtual filesystem index embedded in each snapshot: an interned
/// pathname table, an inode table deduping filesystem identities, a
/// hierarchical tree of inode keys, and derived lookup tables.
///
/// Tree mutation takes per-node locks on `children`; the side tables each
/// have their own lock, so concurrent builders and scanners are safe.
pub struct Filesystem {
    root: Arc<Node>,
    inodes: Mutex<HashMap<String, FileInfo>>,
    pathnames: Mutex<PathnameTable>,
    /// Derived from walking root + inodes; rebuilt on load.
    stat_info: Mutex<HashMap<String, FileInfo>>,
    /// Symlink targets preserved verbatim, never dereferenced.
    symlinks: Mutex<HashMap<String, String>>,
    n_files: AtomicU64,
    n_directories: AtomicU64,
    total_size: AtomicU64,
}

/// Canonicalize a pathname: forward slashes, no duplicate or trailing
/// separators, `.` atoms dropped, `..` atoms resolved. `"."` maps to `"/"`.
pub fn clean_path(pathname: &str) -> String {
    let mut atoms: Vec<&str> = Vec::new();
    for atom in pathname.split('/') {
        match atom {
            "" | "." => {}
            ".." => {
                atoms.pop();
            }
            other => atoms.push(other),
        }
    }
    if atoms.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", atoms.join("/"))
    }
}

impl Filesystem {
    pub fn new() -> Self {
        Filesystem {
            root: Node::new(),
            inodes: Mutex::new(HashMap::new()),
            pathnames: Mutex::new(PathnameTable {
                next_id: 0,
                forward: HashMap::new(),
                inverse: HashMap::new(),
            }),
            stat_info: Mutex::new(HashMap::new()),
            symlinks: Mutex::new(HashMap::new()),
            n_files: AtomicU64::new(0),
            n_directories: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
        }
    }

    /// Insert an inode record if its identity is new. Returns the key.
    fn add_inode(&self, info: &FileInfo) -> String {
        let key = info.inode_key();
        let mut inodes = self.inodes.lock().unwrap();
        if !inodes.contains_key(&key) {
            self.total_size.fetch_add(info.size, Ordering::Relaxed);
            inodes.insert(key.clone(), info.clone());
        }
        key
    }

    /// Intern a pathname; first insertion assigns the next id.
    fn add_pathname(&self, pathname: &str) -> u64 {
        let mut table = self.pathnames.lock().unwrap();
        if let Some(&id) = table.forward.get(pathname) {
            return id;
        }
        let id = table.next_id;
        table.next_id += 1;
        table.forward.insert(pathname.to_string(), id);
        table.inverse.insert(id, pathname.to_string());
        id
    }

    /// Record one path into the index: interns the pathname, dedups the
    /// inode, descends the tree creating missing nodes, and updates the
    /// derived stat table and counters.
    pub fn record(&self, pathname: &str, info: &FileInfo) {
        let inode_key = self.add_inode(info);
        let pathname = clean_path(pathname);
        self.add_pathname(&pathname);

        let mut node = Arc::clone(&self.root);
        if pathname != "/" {
            for atom in pathname.split('/').skip(1) {
                let next = node.child_or_create(atom);
                node = next;
            }
        }
        *node.inode_key.lock().unwrap() = inode_key;

        self.stat_info
            .lock()
            .unwrap()
            .insert(pathname, info.clone());

        if info.is_regular() {
            self.n_files.fetch_add(1, Ordering::Relaxed);
        } else if info.is_dir() {
            self.n_directories.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a symlink's target, verbatim.
    pub fn record_symlink(&self, pathname: &str, target: &str) {
        self.symlinks
            .lock()
            .unwrap()
            .insert(clean_path(pathname), target.to_string());
    }

    /// Resolve a pathname to its tree node, atom by atom.
    pub fn lookup(&self, pathname: &str) -> Result<Arc<Node>> {
        let pathname = clean_path(pathname);
        let mut node = Arc::clone(&self.root);
        if pathname == "/" {
            return Ok(node);
        }
        for atom in pathname.split('/').skip(1) {
            match node.child(atom) {
                Some(next) => node = next,
                None => return Err(CairnError::NotFound(pathname)),
            }
        }
        Ok(node)
    }

    /// Stat record for a pathname, any kind.
    pub fn lookup_inode(&self, pathname: &str) -> Option<FileInfo> {
        self.stat_info
            .lock()
            .unwrap()
            .get(&clean_path(pathname))
            .cloned()
    }

    /// Stat record for a pathname, restricted to regular files.
    pub fn lookup_inode_for_file(&self, pathname: &str) -> Result<FileInfo> {
        let pathname = clean_path(pathname);
        match self.stat_info.lock().unwrap().get(&pathname) {
            Some(info) if info.is_regular() => Ok(info.clone()),
            _ => Err(CairnError::NotFound(pathname)),
        }
    }

    /// Stat record for a pathname, restricted to directories.
    pub fn lookup_inode_for_directory(&self, pathname: &str) -> Result<FileInfo> {
        let pathname = clean_path(pathname);
        match self.stat_info.lock().unwrap().get(&pathname) {
            Some(info) if info.is_dir() => Ok(info.clone()),
            _ => Err(CairnError::NotFound(pathname)),
        }
    }

    /// Sorted child names of a directory node.
    pub fn lookup_children(&self, pathname: &str) -> Result<Vec<String>> {
        let cleaned = clean_path(pathname);
        let node = self.lookup(&cleaned)?;

        let inode_key = node.inode_key();
        let is_dir = self
            .inodes
            .lock()
            .unwrap()
            .get(&inode_key)
            .map(|info| info.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(CairnError::NotADirectory(cleaned));
        }

        // BTreeMap keeps children sorted already.
        let children = node.children.lock().unwrap().keys().cloned().collect();
        Ok(children)
    }

    pub fn list_files(&self) -> Vec<String> {
        self.stat_info
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, info)| info.is_regular())
            .map(|(pathname, _)| pathname.clone())
            .collect()
    }

    pub fn list_directories(&self) -> Vec<String> {
        self.stat_info
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, info)| info.is_dir())
            .map(|(pathname, _)| pathname.clone())
            .collect()
    }

    pub fn list_non_regular(&self) -> Vec<String> {
        self.stat_info
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, info)| !info.is_regular() && !info.is_dir())
            .map(|(pathname, _)| pathname.clone())
            .collect()
    }

    pub fn list_stat(&self) -> Vec<String> {
        self.stat_info.lock().unwrap().keys().cloned().collect()
    }

    pub fn symlink_target(&self, pathname: &str) -> Option<String> {
        self.symlinks
            .lock()
            .unwrap()
            .get(&clean_path(pathname))
            .cloned()
    }

    pub fn pathname_id(&self, pathname: &str) -> Option<u64> {
        self.pathnames.lock().unwrap().forward.get(pathname).copied()
    }

    pub fn pathname_by_id(&self, id: u64) -> Option<String> {
        self.pathnames.lock().unwrap().inverse.get(&id).cloned()
    }

    pub fn summary(&self) -> Summary {
        Summary {
            files: self.n_files.load(Ordering::Relaxed),
            directories: self.n_directories.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
        }
    }

    /// Rebuild the derived tables: the inverse pathname map from the
    /// forward map, and stat_info + total_size by a recursive walk from
    /// `"/"` joining tree nodes with their inode records.
    pub fn reindex(&self) {
        {
            let mut table = self.pathnames.lock().unwrap();
            table.inverse = table
                .forward
                .iter()
                .map(|(pathname, &id)| (id, pathname.clone()))
                .collect();
            table.next_id = table.forward.values().max().map_or(0, |&max| max + 1);
        }

        self.stat_info.lock().unwrap().clear();
        self.total_size.store(0, Ordering::Relaxed);
        self.walk_reindex(&self.root, "/");
    }

    fn walk_reindex(&self, node: &Arc<Node>, pathname: &str) {
        let inode_key = node.inode_key();
        if let Some(info) = self.inodes.lock().unwrap().get(&inode_key).cloned() {
            self.total_size.fetch_add(info.size, Ordering::Relaxed);
            self.stat_info
                .lock()
                .unwrap()
                .insert(pathname.to_string(), info);
        }

        let children: Vec<(String, Arc<Node>)> = node
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|(name, child)| (name.clone(), Arc::clone(child)))
            .collect();
        for (name, child) in children {
            let child_path = if pathname == "/" {
                format!("/{name}")
            } else {
                format!("{pathname}/{name}")
            };
            self.walk_reindex(&child, &child_path);
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&self.to_repr())?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let repr: FilesystemRepr = rmp_serde::from_slice(data)?;
        let fs = Self::from_repr(repr);
        fs.reindex();
        Ok(fs)
    }

    fn to_repr(&self) -> FilesystemRepr {
        FilesystemRepr {
            root: node_to_repr(&self.root),
            inodes: self.inodes.lock().unwrap().clone(),
            pathnames: self.pathnames.lock().unwrap().forward.clone(),
            symlinks: self.symlinks.lock().unwrap().clone(),
            n_files: self.n_files.load(Ordering::Relaxed),
            n_directories: self.n_directories.load(Ordering::Relaxed),
        }
    }

    fn from_repr(repr: FilesystemRepr) -> Self {
        Filesystem {
            root: node_from_repr(repr.root),
            inodes: Mutex::new(repr.inodes),
            pathnames: Mutex::new(PathnameTable {
                next_id: 0, // fixed by reindex()
                forward: repr.pathnames,
                inverse: HashMap::new(),
            }),
            stat_info: Mutex::new(HashMap::new()),
            symlinks: Mutex::new(repr.symlinks),
            n_files: AtomicU64::new(repr.n_files),
            n_directories: AtomicU64::new(repr.n_directories),
            total_size: AtomicU64::new(0),
        }
    }
}

impl Default for Filesystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized form: tree nodes as plain nested maps, locks stripped.
#[derive(Serialize, Deserialize)]
struct NodeRepr {
    inode_key: String,
    children: BTreeMap<String, NodeRepr>,
}

#[derive(Serialize, Deserialize)]
struct FilesystemRepr {
    root: NodeRepr,
    inodes: HashMap<String, FileInfo>,
    pathnames: HashMap<String, u64>,
    symlinks: HashMap<String, String>,
    n_files: u64,
    n_directories: u64,
}

fn node_to_repr(node: &Arc<Node>) -> NodeRepr {
    NodeRepr {
        inode_key: node.inode_key(),
        children: node
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|(name, child)| (name.clone(), node_to_repr(child)))
            .collect(),
    }
}

fn node_from_repr(repr: NodeRepr) -> Arc<Node> {
    Arc::new(Node {
        inode_key: Mutex::new(repr.inode_key),
        children: Mutex::new(
            repr.children
                .into_iter()
                .map(|(name, child)| (name, node_from_repr(child)))
                .collect(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::entry::{S_IFDIR, S_IFLNK, S_IFREG};
    use super::*;

    fn dir(name: &str, ino: u64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: 4096,
            mode: S_IFDIR | 0o755,
            mod_time: 0,
            dev: 1,
            ino,
            uid: 0,
            gid: 0,
        }
    }

    fn file(name: &str, size: u64, ino: u64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size,
            mode: S_IFREG | 0o644,
            mod_time: 0,
            dev: 1,
            ino,
            uid: 0,
            gid: 0,
        }
    }

    fn sample_fs() -> Filesystem {
        let fs = Filesystem::new();
        fs.record("/", &dir("/", 1));
        fs.record("/home", &dir("home", 2));
        fs.record("/home/a.txt", &file("a.txt", 100, 3));
        fs.record("/home/b.txt", &file("b.txt", 200, 4));
        fs.record("/etc", &dir("etc", 5));
        fs
    }

    #[test]
    fn clean_path_canonicalizes() {
        assert_eq!(clean_path("."), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("/a//b/"), "/a/b");
        assert_eq!(clean_path("/a/./b"), "/a/b");
        assert_eq!(clean_path("/a/../b"), "/b");
        assert_eq!(clean_path("a/b"), "/a/b");
    }

    #[test]
    fn root_lookup_returns_root_without_descent() {
        let fs = sample_fs();
        let node = fs.lookup("/").unwrap();
        assert_eq!(node.inode_key(), "1,1");
        // "." maps to "/".
        assert_eq!(fs.lookup(".").unwrap().inode_key(), "1,1");
    }

    #[test]
    fn lookup_missing_path_fails() {
        let fs = sample_fs();
        assert!(matches!(
            fs.lookup("/home/missing"),
            Err(CairnError::NotFound(_))
        ));
    }

    #[test]
    fn typed_lookups_enforce_kind() {
        let fs = sample_fs();
        assert!(fs.lookup_inode_for_file("/home/a.txt").is_ok());
        assert!(fs.lookup_inode_for_file("/home").is_err());
        assert!(fs.lookup_inode_for_directory("/home").is_ok());
        assert!(fs.lookup_inode_for_directory("/home/a.txt").is_err());
    }

    #[test]
    fn children_are_sorted() {
        let fs = sample_fs();
        assert_eq!(fs.lookup_children("/home").unwrap(), vec!["a.txt", "b.txt"]);
        assert_eq!(fs.lookup_children("/").unwrap(), vec!["etc", "home"]);
    }

    #[test]
    fn children_of_file_is_not_a_directory() {
        let fs = sample_fs();
        assert!(matches!(
            fs.lookup_children("/home/a.txt"),
            Err(CairnError::NotADirectory(_))
        ));
    }

    #[test]
    fn listings_partition_by_kind() {
        let fs = sample_fs();
        let mut files = fs.list_files();
        files.sort();
        assert_eq!(files, vec!["/home/a.txt", "/home/b.txt"]);

        let mut dirs = fs.list_directories();
        dirs.sort();
        assert_eq!(dirs, vec!["/", "/etc", "/home"]);
    }

    #[test]
    fn summary_counts_nodes() {
        let fs = sample_fs();
        let summary = fs.summary();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 3);
        assert_eq!(summary.total_size, 100 + 200 + 3 * 4096);
    }

    #[test]
    fn inode_dedup_across_paths() {
        let fs = Filesystem::new();
        fs.record("/", &dir("/", 1));
        // Hard link: same (dev, ino) under two paths.
        fs.record("/one", &file("one", 500, 9));
        fs.record("/two", &file("two", 500, 9));

        assert_eq!(fs.summary().total_size, 4096 + 500);
        assert_eq!(
            fs.lookup("/one").unwrap().inode_key(),
            fs.lookup("/two").unwrap().inode_key()
        );
    }

    #[test]
    fn pathnames_are_a_bijection() {
        let fs = sample_fs();
        for pathname in fs.list_stat() {
            let id = fs.pathname_id(&pathname).unwrap();
            assert_eq!(fs.pathname_by_id(id).unwrap(), pathname);
        }
        // First-insertion order assigns consecutive ids.
        assert_eq!(fs.pathname_id("/"), Some(0));
        assert_eq!(fs.pathname_id("/home"), Some(1));
    }

    #[test]
    fn symlink_target_verbatim() {
        let fs = sample_fs();
        fs.record_symlink("/home/link", "../etc/./passwd");
        assert_eq!(
            fs.symlink_target("/home/link").unwrap(),
            "../etc/./passwd"
        );
    }

    #[test]
    fn serialize_reindex_roundtrip() {
        let fs = sample_fs();
        fs.record_symlink("/home/link", "/etc");
        let bytes = fs.serialize().unwrap();

        let restored = Filesystem::deserialize(&bytes).unwrap();

        // Invariant: stat_info[p] equals inodes[lookup(p).inode_key] for
        // every built path.
        for pathname in fs.list_stat() {
            let original = fs.lookup_inode(&pathname).unwrap();
            let rebuilt = restored.lookup_inode(&pathname).unwrap();
            assert_eq!(original, rebuilt, "stat mismatch at {pathname}");

            let node = restored.lookup(&pathname).unwrap();
            assert_eq!(rebuilt.inode_key(), node.inode_key());
        }

        assert_eq!(restored.summary(), fs.summary());
        assert_eq!(restored.symlink_target("/home/link").unwrap(), "/etc");

        // Bijection survives reconstruction.
        for pathname in restored.list_stat() {
            let id = restored.pathname_id(&pathname).unwrap();
            assert_eq!(restored.pathname_by_id(id).unwrap(), pathname);
        }
    }

    #[test]
    fn interning_continues_after_reload() {
        let fs = sample_fs();
        let bytes = fs.serialize().unwrap();
        let restored = Filesystem::deserialize(&bytes).unwrap();

        let max_id = restored
            .list_stat()
            .iter()
            .map(|p| restored.pathname_id(p).unwrap())
            .max()
            .unwrap();
        restored.record("/new", &file("new", 1, 99));
        assert_eq!(restored.pathname_id("/new"), Some(max_id + 1));
    }

    #[test]
    fn concurrent_builders_are_safe() {
        let fs = Arc::new(Filesystem::new());
        fs.record("/", &dir("/", 1));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let fs = Arc::clone(&fs);
            handles.push(std::thread::spawn(move || {
                fs.record(&format!("/dir{t}"), &dir(&format!("dir{t}"), 2 + t));
                for i in 0..50u64 {
                    let ino = 10 + t * 100 + i;
                    fs.record(
                        &format!("/dir{t}/file{i}"),
                        &file(&format!("file{i}"), 10, ino),
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fs.summary().files, 200);
        assert_eq!(fs.list_files().len(), 200);
        for t in 0..4 {
            assert_eq!(fs.lookup_children(&format!("/dir{t}")).unwrap().len(), 50);
        }
    }

    #[test]
    fn non_regular_listing() {
        let fs = sample_fs();
        let link = FileInfo {
            name: "link".into(),
            size: 0,
            mode: S_IFLNK | 0o777,
            mod_time: 0,
            dev: 1,
            ino: 77,
            uid: 0,
            gid: 0,
        };
        fs.record("/home/link", &link);
        fs.record_symlink("/home/link", "/etc");
        assert_eq!(fs.list_non_regular(), vec!["/home/link"]);
    }
}
