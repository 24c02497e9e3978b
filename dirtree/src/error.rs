use crate::{DirFragId, FragTag};

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("unknown dirfrag {0}")]
    UnknownFrag(DirFragId),
    #[error("dirfrag {0} is frozen or freezing")]
    Frozen(DirFragId),
    #[error("fragment {tag} is not valid for {frag}")]
    InvalidFrag { frag: DirFragId, tag: FragTag },
    #[error("no directory at {0}")]
    NotFound(String),
    #[error("{0} would be moved under its own subtree")]
    Cycle(DirFragId),
}
