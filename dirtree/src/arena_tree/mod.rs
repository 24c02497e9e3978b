use std::collections::HashMap;

use tracing::{debug, trace};

use crate::{DirFragId, DirectoryTree, FragTag, Rank, TreeError};

#[derive(Clone, Debug)]
struct DirFragNode {
    ino: u64,
    tag: FragTag,
    path: String,
    parent: Option<DirFragId>,
    children: Vec<DirFragId>,
    authority: Rank,
    subtree_root: bool,
    ambiguous: bool,
    frozen: bool,
    freezing: bool,
    stray: bool,
    base: bool,
    replicated: bool,
    export_pin: Option<Rank>,
    size: usize,
    removed: bool,
}

/// In-memory namespace where every fragment lives in one vector and links are
/// indexes into it.
#[derive(Clone, Debug)]
pub struct ArenaTree {
    whoami: Rank,
    nodes: Vec<DirFragNode>,
    next_ino: u64,
    // directory inode -> its live fragments
    dirs: HashMap<u64, Vec<DirFragId>>,
}

impl ArenaTree {
    /// Creates a namespace holding only the root directory, served by `root_authority`.
    pub fn new(whoami: Rank, root_authority: Rank) -> Self {
        let root = DirFragNode {
            ino: 1,
            tag: FragTag::ROOT,
            path: "/".to_string(),
            parent: None,
            children: Vec::new(),
            authority: root_authority,
            subtree_root: true,
            ambiguous: false,
            frozen: false,
            freezing: false,
            stray: false,
            base: true,
            replicated: false,
            export_pin: None,
            size: 0,
            removed: false,
        };
        Self {
            whoami,
            nodes: vec![root],
            next_ino: 2,
            dirs: HashMap::from([(1, vec![DirFragId(0)])]),
        }
    }
    pub fn root(&self) -> DirFragId {
        DirFragId(0)
    }
    fn node(&self, frag: DirFragId) -> &DirFragNode {
        match self.nodes.get(frag.0) {
            Some(node) if !node.removed => node,
            _ => panic!("{frag} is not part of the tree"),
        }
    }
    fn node_mut(&mut self, frag: DirFragId) -> Result<&mut DirFragNode, TreeError> {
        match self.nodes.get_mut(frag.0) {
            Some(node) if !node.removed => Ok(node),
            _ => Err(TreeError::UnknownFrag(frag)),
        }
    }
    fn child_path(parent_path: &str, name: &str) -> String {
        if parent_path.ends_with('/') {
            format!("{parent_path}{name}")
        } else {
            format!("{parent_path}/{name}")
        }
    }

    /// Links a new single-fragment directory under `parent`, inheriting its authority.
    pub fn add_dir(&mut self, parent: DirFragId, name: &str) -> Result<DirFragId, TreeError> {
        let parent_node = self.node_mut(parent)?;
        parent_node.size += 1;
        let path = Self::child_path(&parent_node.path, name);
        let authority = parent_node.authority;
        let ino = self.next_ino;
        self.next_ino += 1;
        let id = DirFragId(self.nodes.len());
        self.nodes.push(DirFragNode {
            ino,
            tag: FragTag::ROOT,
            path,
            parent: Some(parent),
            children: Vec::new(),
            authority,
            subtree_root: false,
            ambiguous: false,
            frozen: false,
            freezing: false,
            stray: false,
            base: false,
            replicated: false,
            export_pin: None,
            size: 0,
            removed: false,
        });
        self.nodes[parent.0].children.push(id);
        self.dirs.insert(ino, vec![id]);
        trace!(%id, %ino, "Added directory");
        Ok(id)
    }
    /// Adds a system directory (stray or per-rank) below `parent`.
    pub fn add_system_dir(
        &mut self,
        parent: DirFragId,
        name: &str,
        stray: bool,
    ) -> Result<DirFragId, TreeError> {
        let id = self.add_dir(parent, name)?;
        let node = self.node_mut(id)?;
        node.stray = stray;
        node.base = !stray;
        Ok(id)
    }
    /// Adds nested directories for every component of `path` that does not exist yet.
    pub fn add_path(&mut self, path: &str) -> Result<DirFragId, TreeError> {
        let mut current = self.root();
        for name in path.split('/').filter(|c| !c.is_empty()) {
            let child_path = Self::child_path(&self.node(current).path, name);
            current = match self.lookup(&child_path) {
                Some(existing) => existing,
                None => self.add_dir(current, name)?,
            };
        }
        Ok(current)
    }
    pub fn lookup(&self, path: &str) -> Option<DirFragId> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, node)| !node.removed && node.path == path)
            .map(|(i, _)| DirFragId(i))
    }

    pub fn set_size(&mut self, frag: DirFragId, size: usize) -> Result<(), TreeError> {
        self.node_mut(frag)?.size = size;
        Ok(())
    }
    pub fn set_frozen(&mut self, frag: DirFragId, frozen: bool) -> Result<(), TreeError> {
        self.node_mut(frag)?.frozen = frozen;
        Ok(())
    }
    pub fn set_freezing(&mut self, frag: DirFragId, freezing: bool) -> Result<(), TreeError> {
        self.node_mut(frag)?.freezing = freezing;
        Ok(())
    }
    pub fn set_replicated(&mut self, frag: DirFragId, replicated: bool) -> Result<(), TreeError> {
        self.node_mut(frag)?.replicated = replicated;
        Ok(())
    }
    pub fn set_ambiguous(&mut self, frag: DirFragId, ambiguous: bool) -> Result<(), TreeError> {
        self.node_mut(frag)?.ambiguous = ambiguous;
        Ok(())
    }
    /// Pins are an inode property, every fragment of the directory carries it.
    pub fn set_export_pin(&mut self, frag: DirFragId, pin: Option<Rank>) -> Result<(), TreeError> {
        let ino = self.node_mut(frag)?.ino;
        for id in self.dirs.get(&ino).cloned().unwrap_or_default() {
            self.nodes[id.0].export_pin = pin;
        }
        Ok(())
    }

    /// Hands `frag` and the region below it that shared its authority over to `rank`.
    pub fn set_subtree_authority(&mut self, frag: DirFragId, rank: Rank) -> Result<(), TreeError> {
        let old = self.node_mut(frag)?.authority;
        let mut stack = vec![frag];
        while let Some(id) = stack.pop() {
            let node = &mut self.nodes[id.0];
            if node.removed || (id != frag && node.authority != old) {
                continue;
            }
            node.authority = rank;
            stack.extend(node.children.iter().copied());
        }
        self.refresh_subtree_roots();
        debug!(%frag, from = old, to = rank, "Subtree authority changed");
        Ok(())
    }
    fn refresh_subtree_roots(&mut self) {
        for i in 0..self.nodes.len() {
            let boundary = match self.nodes[i].parent {
                Some(parent) => self.nodes[parent.0].authority != self.nodes[i].authority,
                None => true,
            };
            self.nodes[i].subtree_root = boundary;
        }
    }

    /// Splits `frag` into `2^bits` fragments of the same directory. Child
    /// directories and entries are dealt round robin between the new fragments.
    pub fn split(&mut self, frag: DirFragId, bits: u8) -> Result<Vec<DirFragId>, TreeError> {
        let node = self.node_mut(frag)?;
        if node.frozen || node.freezing {
            return Err(TreeError::Frozen(frag));
        }
        let tags = node.tag.split(bits);
        if tags.len() < 2 {
            return Err(TreeError::InvalidFrag {
                frag,
                tag: node.tag,
            });
        }
        let template = node.clone();
        let children = std::mem::take(&mut node.children);
        node.tag = tags[0];
        let mut ids = vec![frag];
        for tag in &tags[1..] {
            let id = DirFragId(self.nodes.len());
            self.nodes.push(DirFragNode {
                tag: *tag,
                children: Vec::new(),
                ..template.clone()
            });
            ids.push(id);
        }
        let share = template.size / ids.len();
        let extra = template.size % ids.len();
        for (i, id) in ids.iter().enumerate() {
            self.nodes[id.0].size = share + usize::from(i < extra);
        }
        for (i, child) in children.into_iter().enumerate() {
            let owner = ids[i % ids.len()];
            self.nodes[owner.0].children.push(child);
            for sibling in self.dirs.get(&self.nodes[child.0].ino).cloned().unwrap_or_default() {
                self.nodes[sibling.0].parent = Some(owner);
            }
        }
        if let Some(parent) = template.parent {
            self.nodes[parent.0].children.extend(ids[1..].iter().copied());
        }
        self.dirs.entry(template.ino).or_default().extend(ids[1..].iter().copied());
        debug!(%frag, bits, count = ids.len(), "Split dirfrag");
        Ok(ids)
    }

    /// Folds every fragment of `frag`'s directory that falls under `into` back
    /// into one fragment and returns its handle.
    pub fn merge(&mut self, frag: DirFragId, into: FragTag) -> Result<DirFragId, TreeError> {
        let ino = self.node_mut(frag)?.ino;
        let covered: Vec<DirFragId> = self
            .dirs
            .get(&ino)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| into.contains(&self.nodes[id.0].tag))
            .collect();
        if !covered.contains(&frag) {
            return Err(TreeError::InvalidFrag { frag, tag: into });
        }
        if covered
            .iter()
            .any(|id| self.nodes[id.0].frozen || self.nodes[id.0].freezing)
        {
            return Err(TreeError::Frozen(frag));
        }
        let survivor = covered.iter().copied().min().unwrap_or(frag);
        for id in covered.iter().copied().filter(|id| *id != survivor) {
            let children = std::mem::take(&mut self.nodes[id.0].children);
            let size = self.nodes[id.0].size;
            self.nodes[id.0].removed = true;
            for child in &children {
                for sibling in self.dirs.get(&self.nodes[child.0].ino).cloned().unwrap_or_default() {
                    self.nodes[sibling.0].parent = Some(survivor);
                }
            }
            let survivor_node = &mut self.nodes[survivor.0];
            survivor_node.children.extend(children);
            survivor_node.size += size;
            if let Some(parent) = self.nodes[id.0].parent {
                self.nodes[parent.0].children.retain(|c| *c != id);
            }
        }
        self.nodes[survivor.0].tag = into;
        if let Some(frags) = self.dirs.get_mut(&ino) {
            frags.retain(|id| *id == survivor || !covered.contains(id));
        }
        debug!(%survivor, %into, merged = covered.len(), "Merged dirfrags");
        Ok(survivor)
    }

    /// Relinks the directory owning `frag` below `new_parent`.
    pub fn move_dir(&mut self, frag: DirFragId, new_parent: DirFragId) -> Result<(), TreeError> {
        let ino = self.node_mut(frag)?.ino;
        self.node_mut(new_parent)?;
        let mut cursor = Some(new_parent);
        while let Some(id) = cursor {
            if self.nodes[id.0].ino == ino {
                return Err(TreeError::Cycle(frag));
            }
            cursor = self.nodes[id.0].parent;
        }
        let frags = self.dirs.get(&ino).cloned().unwrap_or_default();
        let Some(old_parent) = self.nodes[frag.0].parent else {
            return Err(TreeError::Cycle(frag));
        };
        let name = self.nodes[frag.0]
            .path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        self.nodes[old_parent.0].children.retain(|c| !frags.contains(c));
        self.nodes[old_parent.0].size = self.nodes[old_parent.0].size.saturating_sub(1);
        self.nodes[new_parent.0].children.extend(frags.iter().copied());
        self.nodes[new_parent.0].size += 1;
        let path = Self::child_path(&self.nodes[new_parent.0].path, &name);
        for id in &frags {
            self.nodes[id.0].parent = Some(new_parent);
        }
        self.repath(&frags, &path);
        self.refresh_subtree_roots();
        Ok(())
    }
    fn repath(&mut self, frags: &[DirFragId], path: &str) {
        for id in frags {
            let old = std::mem::replace(&mut self.nodes[id.0].path, path.to_string());
            let children = self.nodes[id.0].children.clone();
            for child in children {
                let suffix = self.nodes[child.0].path[old.len()..].to_string();
                let child_frags = vec![child];
                self.repath(&child_frags, &format!("{path}{suffix}"));
            }
        }
    }
}

impl DirectoryTree for ArenaTree {
    fn whoami(&self) -> Rank {
        self.whoami
    }
    fn root_frags(&self) -> Vec<DirFragId> {
        self.dirs.get(&1).cloned().unwrap_or_default()
    }
    fn full_auth_subtrees(&self) -> Vec<DirFragId> {
        self.auth_subtrees()
            .into_iter()
            .filter(|id| !self.nodes[id.0].ambiguous)
            .collect()
    }
    fn auth_subtrees(&self) -> Vec<DirFragId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.removed && n.subtree_root && n.authority == self.whoami)
            .map(|(i, _)| DirFragId(i))
            .collect()
    }
    fn contains(&self, frag: DirFragId) -> bool {
        self.nodes.get(frag.0).is_some_and(|n| !n.removed)
    }
    fn parent(&self, frag: DirFragId) -> Option<DirFragId> {
        self.node(frag).parent
    }
    fn children(&self, frag: DirFragId) -> Vec<DirFragId> {
        self.node(frag).children.clone()
    }
    fn dir_frags(&self, frag: DirFragId) -> Vec<DirFragId> {
        self.dirs
            .get(&self.node(frag).ino)
            .cloned()
            .unwrap_or_else(|| vec![frag])
    }
    fn authority(&self, frag: DirFragId) -> Rank {
        self.node(frag).authority
    }
    fn is_frozen(&self, frag: DirFragId) -> bool {
        self.node(frag).frozen
    }
    fn is_freezing(&self, frag: DirFragId) -> bool {
        self.node(frag).freezing
    }
    fn is_subtree_root(&self, frag: DirFragId) -> bool {
        self.node(frag).subtree_root
    }
    fn is_stray(&self, frag: DirFragId) -> bool {
        self.node(frag).stray
    }
    fn is_base(&self, frag: DirFragId) -> bool {
        self.node(frag).base
    }
    fn is_replicated(&self, frag: DirFragId) -> bool {
        self.node(frag).replicated
    }
    fn export_pin(&self, frag: DirFragId) -> Option<Rank> {
        self.node(frag).export_pin
    }
    fn path(&self, frag: DirFragId) -> String {
        self.node(frag).path.clone()
    }
    fn ino(&self, frag: DirFragId) -> u64 {
        self.node(frag).ino
    }
    fn frag_tag(&self, frag: DirFragId) -> FragTag {
        self.node(frag).tag
    }
    fn frag_size(&self, frag: DirFragId) -> usize {
        self.node(frag).size
    }
}
