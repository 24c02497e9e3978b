pub mod arena_tree;
pub mod error;
pub mod frag;
pub mod tree;

pub use arena_tree::ArenaTree;
pub use error::TreeError;
pub use frag::FragTag;
pub use tree::{DirFragId, DirectoryTree, Rank};
