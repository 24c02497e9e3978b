use serde::{Deserialize, Serialize};
use std::fmt;

use crate::FragTag;

pub type Rank = u32;

/// Stable handle of one directory fragment. Handles are never reused, a merged
/// away fragment simply stops being `contains`ed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirFragId(pub usize);

impl fmt::Display for DirFragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dirfrag#{}", self.0)
    }
}

/// Read view of the namespace as seen by one rank.
///
/// Lookups of a handle that is not `contains`ed are programming errors and panic.
pub trait DirectoryTree {
    fn whoami(&self) -> Rank;
    /// Fragments of the root directory.
    fn root_frags(&self) -> Vec<DirFragId>;
    /// Subtree roots this rank is the unambiguous authority for.
    fn full_auth_subtrees(&self) -> Vec<DirFragId>;
    /// Subtree roots this rank is authority for, including the ones mid migration.
    fn auth_subtrees(&self) -> Vec<DirFragId>;
    fn contains(&self, frag: DirFragId) -> bool;
    /// Fragment holding the dentry of this fragment's directory.
    fn parent(&self, frag: DirFragId) -> Option<DirFragId>;
    /// Fragments of the directories linked from this fragment.
    fn children(&self, frag: DirFragId) -> Vec<DirFragId>;
    /// Every fragment of the directory `frag` belongs to, `frag` included.
    fn dir_frags(&self, frag: DirFragId) -> Vec<DirFragId>;
    fn authority(&self, frag: DirFragId) -> Rank;
    /// Authority of the directory inode, which for a subtree root is the rank
    /// owning the parent fragment.
    fn inode_authority(&self, frag: DirFragId) -> Rank {
        match self.parent(frag) {
            Some(parent) => self.authority(parent),
            None => self.authority(frag),
        }
    }
    fn is_auth(&self, frag: DirFragId) -> bool {
        self.authority(frag) == self.whoami()
    }
    fn is_frozen(&self, frag: DirFragId) -> bool;
    fn is_freezing(&self, frag: DirFragId) -> bool;
    fn is_subtree_root(&self, frag: DirFragId) -> bool;
    /// Stray and other system directories that never migrate.
    fn is_stray(&self, frag: DirFragId) -> bool;
    /// Root or per-rank system directory.
    fn is_base(&self, frag: DirFragId) -> bool;
    fn is_replicated(&self, frag: DirFragId) -> bool;
    fn export_pin(&self, frag: DirFragId) -> Option<Rank>;
    fn path(&self, frag: DirFragId) -> String;
    fn ino(&self, frag: DirFragId) -> u64;
    fn frag_tag(&self, frag: DirFragId) -> FragTag;
    /// Number of entries in the fragment.
    fn frag_size(&self, frag: DirFragId) -> usize;
}
