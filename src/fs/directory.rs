use crate::fs::node::{DirNode, NodeId};

impl DirNode {
    pub fn new(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        DirNode { name: name.into(), parent, children: Default::default() }
    }

    pub fn has_child_named(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn child_named(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn insert_child(&mut self, name: impl Into<String>, id: NodeId) {
        self.children.insert(name.into(), id);
    }

    pub fn remove_child(&mut self, name: &str) -> Option<NodeId> {
        self.children.remove(name)
    }
}
