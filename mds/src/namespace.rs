use dirtree::{ArenaTree, Rank, TreeError};
use utilities::logger::debug;

use crate::config::DirLayout;

/// Builds the namespace every rank starts from: one system directory per rank
/// holding its stray directory, then the configured layout.
pub fn build(
    whoami: Rank,
    cluster_size: usize,
    root_authority: Rank,
    layout: &[DirLayout],
) -> Result<ArenaTree, TreeError> {
    let mut tree = ArenaTree::new(whoami, root_authority);
    let root = tree.root();
    for rank in 0..cluster_size as Rank {
        let mdsdir = tree.add_system_dir(root, &format!("~mds{rank}"), false)?;
        tree.add_system_dir(mdsdir, "stray", true)?;
        if rank != root_authority {
            tree.set_subtree_authority(mdsdir, rank)?;
        }
    }
    for dir in layout {
        let frag = tree.add_path(&dir.path)?;
        if dir.entries > 0 {
            tree.set_size(frag, dir.entries)?;
        }
        if let Some(rank) = dir.authority {
            tree.set_subtree_authority(frag, rank)?;
        }
        if dir.export_pin.is_some() {
            tree.set_export_pin(frag, dir.export_pin)?;
        }
    }
    debug!(dirs = layout.len(), "Namespace built");
    Ok(tree)
}
