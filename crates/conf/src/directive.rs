//! The configuration tree: an arena of directives plus the per-file tables.
//!
//! Directives form a graph with parent back-pointers (directive -> block ->
//! ... -> config), so nodes live in an arena keyed by [`NodeId`] and parents
//! are ids rather than references. Mutation is splice-in-place on the
//! parent's child list. The whole arena sits behind the tree's mutation
//! lock; renewal tasks mutate it through [`Tree::change`] after parsing has
//! finished.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::dump::escape;
use crate::error::ConfError;
use crate::lex::{line_column, Pos, SYNTHETIC};

pub type NodeId = usize;
pub type ConfigId = usize;

/// Where a directive hangs: directly in a config file or inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    Config(ConfigId),
    Block(NodeId),
}

#[derive(Debug)]
pub struct Simple {
    pub name: String,
    pub args: Vec<String>,
    /// Re-escaped source tokens, name first.
    pub(crate) raw: Vec<String>,
    pub pos: Pos,
    pub conf: Option<ConfigId>,
    pub parent: Option<Parent>,
    pub parent_block: Option<NodeId>,
}

#[derive(Debug)]
pub struct Block {
    pub name: String,
    pub args: Vec<String>,
    pub(crate) raw: Vec<String>,
    pub children: Vec<NodeId>,
    pub pos: Pos,
    pub conf: Option<ConfigId>,
    pub parent: Option<Parent>,
    pub parent_block: Option<NodeId>,
}

#[derive(Debug)]
pub struct Include {
    /// The target exactly as written in the source.
    pub target: String,
    /// Resolved configs in glob-expansion order. Empty when the glob
    /// matched nothing.
    pub includes: Vec<ConfigId>,
    pub pos: Pos,
    pub conf: Option<ConfigId>,
    pub parent: Option<Parent>,
    pub parent_block: Option<NodeId>,
}

/// A directive wrapped to be invisible to the serializer until undeferred.
#[derive(Debug)]
pub struct Deferred {
    pub inner: NodeId,
    pub parent: Option<Parent>,
    pub parent_block: Option<NodeId>,
}

#[derive(Debug)]
pub enum Node {
    Simple(Simple),
    Block(Block),
    Include(Include),
    Deferred(Deferred),
}

/// One loaded configuration file.
#[derive(Debug)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub(crate) text: String,
    pub children: Vec<NodeId>,
    /// The include directive that pulled this file in, if any.
    pub parent: Option<NodeId>,
    /// The block enclosing that include directive, if any.
    pub parent_block: Option<NodeId>,
}

/// The arena: every node and config reachable from the tree.
#[derive(Debug, Default)]
pub struct TreeData {
    pub(crate) nodes: Vec<Node>,
    pub(crate) configs: Vec<ConfigFile>,
    /// Absolute path -> config, each file loaded at most once.
    pub(crate) included: HashMap<PathBuf, ConfigId>,
    pub(crate) root: ConfigId,
}

impl TreeData {
    pub fn root(&self) -> ConfigId {
        self.root
    }

    pub fn config(&self, id: ConfigId) -> &ConfigFile {
        &self.configs[id]
    }

    pub(crate) fn config_mut(&mut self, id: ConfigId) -> &mut ConfigFile {
        &mut self.configs[id]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub(crate) fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub(crate) fn push_config(&mut self, conf: ConfigFile) -> ConfigId {
        self.configs.push(conf);
        self.configs.len() - 1
    }

    /// Directive name. Includes report `include`; deferred wrappers report
    /// the wrapped directive's name.
    pub fn name(&self, id: NodeId) -> &str {
        match &self.nodes[id] {
            Node::Simple(d) => &d.name,
            Node::Block(d) => &d.name,
            Node::Include(_) => "include",
            Node::Deferred(d) => self.name(d.inner),
        }
    }

    /// Parsed argument values. Empty for include directives (use
    /// [`Include::target`]) and resolved through deferred wrappers.
    pub fn args(&self, id: NodeId) -> &[String] {
        match &self.nodes[id] {
            Node::Simple(d) => &d.args,
            Node::Block(d) => &d.args,
            Node::Include(_) => &[],
            Node::Deferred(d) => self.args(d.inner),
        }
    }

    pub fn as_simple(&self, id: NodeId) -> Option<&Simple> {
        match &self.nodes[id] {
            Node::Simple(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_block(&self, id: NodeId) -> Option<&Block> {
        match &self.nodes[id] {
            Node::Block(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_deferred(&self, id: NodeId) -> bool {
        matches!(self.nodes[id], Node::Deferred(_))
    }

    pub fn parent(&self, id: NodeId) -> Option<Parent> {
        match &self.nodes[id] {
            Node::Simple(d) => d.parent,
            Node::Block(d) => d.parent,
            Node::Include(d) => d.parent,
            Node::Deferred(d) => d.parent,
        }
    }

    pub fn parent_block(&self, id: NodeId) -> Option<NodeId> {
        match &self.nodes[id] {
            Node::Simple(d) => d.parent_block,
            Node::Block(d) => d.parent_block,
            Node::Include(d) => d.parent_block,
            Node::Deferred(d) => d.parent_block,
        }
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<Parent>, parent_block: Option<NodeId>) {
        match &mut self.nodes[id] {
            Node::Simple(d) => {
                d.parent = parent;
                d.parent_block = parent_block;
            }
            Node::Block(d) => {
                d.parent = parent;
                d.parent_block = parent_block;
            }
            Node::Include(d) => {
                d.parent = parent;
                d.parent_block = parent_block;
            }
            Node::Deferred(d) => {
                d.parent = parent;
                d.parent_block = parent_block;
            }
        }
    }

    /// `path:line:column` of a directive, for error messages.
    pub fn location(&self, id: NodeId) -> String {
        let (pos, conf) = match &self.nodes[id] {
            Node::Simple(d) => (d.pos, d.conf),
            Node::Block(d) => (d.pos, d.conf),
            Node::Include(d) => (d.pos, d.conf),
            Node::Deferred(d) => return self.location(d.inner),
        };
        match conf {
            Some(cid) => {
                let conf = &self.configs[cid];
                let (line, column) = line_column(&conf.text, pos);
                format!("{}:{}:{}", conf.path.display(), line, column)
            }
            None => "0:0".to_string(),
        }
    }

    fn children_of(&mut self, parent: Parent) -> &mut Vec<NodeId> {
        match parent {
            Parent::Config(cid) => &mut self.configs[cid].children,
            Parent::Block(id) => match &mut self.nodes[id] {
                Node::Block(b) => &mut b.children,
                _ => unreachable!("parent id is not a block"),
            },
        }
    }

    /// Replace `target` with `replacements` in its parent's child list.
    /// A no-op when the target is detached or not present.
    pub fn replace_with(&mut self, target: NodeId, replacements: Vec<NodeId>) {
        let Some(parent) = self.parent(target) else {
            return;
        };
        let parent_block = self.parent_block(target);
        let children = self.children_of(parent);
        let Some(i) = children.iter().position(|&c| c == target) else {
            return;
        };
        children.splice(i..=i, replacements.iter().copied());
        for &r in &replacements {
            self.set_parent(r, Some(parent), parent_block);
        }
    }

    /// Remove `target` from its parent's child list. A no-op when the
    /// target is detached or not present.
    pub fn delete(&mut self, target: NodeId) {
        let Some(parent) = self.parent(target) else {
            return;
        };
        let children = self.children_of(parent);
        if let Some(i) = children.iter().position(|&c| c == target) {
            children.remove(i);
        }
    }

    /// Append `child` to a block's children, adopting it.
    pub fn push_child(&mut self, block: NodeId, child: NodeId) {
        let conf = match &self.nodes[block] {
            Node::Block(b) => b.conf,
            _ => unreachable!("push_child target is not a block"),
        };
        self.set_conf(child, conf);
        self.set_parent(child, Some(Parent::Block(block)), Some(block));
        match &mut self.nodes[block] {
            Node::Block(b) => b.children.push(child),
            _ => unreachable!(),
        }
    }

    /// Append `child` to a config file's top level, adopting it.
    pub fn push_config_child(&mut self, cid: ConfigId, child: NodeId) {
        self.set_conf(child, Some(cid));
        self.set_parent(child, Some(Parent::Config(cid)), None);
        self.configs[cid].children.push(child);
    }

    fn set_conf(&mut self, id: NodeId, conf: Option<ConfigId>) {
        match &mut self.nodes[id] {
            Node::Simple(d) => d.conf = conf,
            Node::Block(d) => d.conf = conf,
            Node::Include(d) => d.conf = conf,
            Node::Deferred(_) => {}
        }
    }

    /// Construct a detached simple directive.
    pub fn new_simple(&mut self, name: &str, args: &[&str]) -> NodeId {
        let mut raw = Vec::with_capacity(args.len() + 1);
        raw.push(escape(name));
        raw.extend(args.iter().map(|a| escape(a)));
        self.push_node(Node::Simple(Simple {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            raw,
            pos: SYNTHETIC,
            conf: None,
            parent: None,
            parent_block: None,
        }))
    }

    /// Construct a detached block directive owning `children`.
    pub fn new_block(&mut self, name: &str, args: &[&str], children: Vec<NodeId>) -> NodeId {
        let mut raw = Vec::with_capacity(args.len() + 1);
        raw.push(escape(name));
        raw.extend(args.iter().map(|a| escape(a)));
        let id = self.push_node(Node::Block(Block {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            raw,
            children: children.clone(),
            pos: SYNTHETIC,
            conf: None,
            parent: None,
            parent_block: None,
        }));
        for child in children {
            self.set_parent(child, Some(Parent::Block(id)), Some(id));
        }
        id
    }

    /// Rewrite `acme_defer NAME ARG...` into a deferred wrapper whose inner
    /// directive is `NAME ARG...`, and swap the wrapper into the parent.
    /// Returns the wrapper's id.
    ///
    /// The directive must have at least one argument.
    pub fn defer(&mut self, target: NodeId) -> NodeId {
        let (parent, parent_block) = (self.parent(target), self.parent_block(target));
        match &mut self.nodes[target] {
            Node::Simple(d) => {
                d.name = d.args.remove(0);
                d.raw.remove(0);
            }
            Node::Block(d) => {
                d.name = d.args.remove(0);
                d.raw.remove(0);
            }
            _ => unreachable!("directive cannot be deferred"),
        }
        let wrapper = self.push_node(Node::Deferred(Deferred {
            inner: target,
            parent,
            parent_block,
        }));
        self.replace_with(target, vec![wrapper]);
        wrapper
    }

    /// Wrap an already-parsed directive without rewriting its name, used to
    /// hide a whole block until its certificate exists.
    pub fn defer_as_is(&mut self, target: NodeId) -> NodeId {
        let (parent, parent_block) = (self.parent(target), self.parent_block(target));
        let wrapper = self.push_node(Node::Deferred(Deferred {
            inner: target,
            parent,
            parent_block,
        }));
        self.replace_with(target, vec![wrapper]);
        wrapper
    }

    /// Replace a deferred wrapper with its inner directive.
    pub fn undefer(&mut self, wrapper: NodeId) {
        let inner = match &self.nodes[wrapper] {
            Node::Deferred(d) => d.inner,
            _ => return,
        };
        self.replace_with(wrapper, vec![inner]);
    }

    /// Update one argument, keeping the raw token in sync.
    pub fn set_arg(&mut self, id: NodeId, i: usize, value: &str) {
        if let Node::Simple(d) = &mut self.nodes[id] {
            d.args[i] = value.to_string();
            d.raw[i + 1] = escape(value);
        }
    }

    fn shape_err(&self, id: NodeId, what: &str) -> ConfError {
        ConfError::BadDirective(format!(
            "{} {} in {}",
            self.name(id),
            what,
            self.location(id)
        ))
    }

    /// Exactly one argument.
    pub fn one_arg(&self, id: NodeId) -> Result<String, ConfError> {
        match self.args(id) {
            [arg] => Ok(arg.clone()),
            _ => Err(self.shape_err(id, "requires one value")),
        }
    }

    /// Exactly two arguments.
    pub fn two_args(&self, id: NodeId) -> Result<(String, String), ConfError> {
        match self.args(id) {
            [a, b] => Ok((a.clone(), b.clone())),
            _ => Err(self.shape_err(id, "requires two values")),
        }
    }

    /// At least one argument.
    pub fn one_plus_args(&self, id: NodeId) -> Result<Vec<String>, ConfError> {
        let args = self.args(id);
        if args.is_empty() {
            return Err(self.shape_err(id, "requires at least one value"));
        }
        Ok(args.to_vec())
    }

    /// A single `on` or `off` argument.
    pub fn bool_arg(&self, id: NodeId) -> Result<bool, ConfError> {
        if let [arg] = self.args(id) {
            match arg.as_str() {
                "on" => return Ok(true),
                "off" => return Ok(false),
                _ => {}
            }
        }
        Err(self.shape_err(id, "must be either on or off"))
    }

    /// A single integer argument.
    pub fn int_arg(&self, id: NodeId) -> Result<i64, ConfError> {
        let arg = self.one_arg(id)?;
        arg.parse()
            .map_err(|_| self.shape_err(id, "must be a number"))
    }
}

/// A parsed configuration tree: the entry file plus everything it includes.
#[derive(Debug)]
pub struct Tree {
    entry: PathBuf,
    confdir: PathBuf,
    data: Mutex<TreeData>,
}

impl Tree {
    pub(crate) fn new(entry: PathBuf, confdir: PathBuf, data: TreeData) -> Self {
        Tree {
            entry,
            confdir,
            data: Mutex::new(data),
        }
    }

    /// Absolute path of the entry configuration file.
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    /// Directory relative include targets are resolved against.
    pub fn confdir(&self) -> &Path {
        &self.confdir
    }

    /// Read access to the arena.
    pub fn with<R>(&self, f: impl FnOnce(&TreeData) -> R) -> R {
        f(&self.data.lock())
    }

    /// Mutate the arena under the tree's mutation lock.
    pub fn change<R>(&self, f: impl FnOnce(&mut TreeData) -> R) -> R {
        f(&mut self.data.lock())
    }

    pub(crate) fn swap_data(&self, data: TreeData) {
        *self.data.lock() = data;
    }
}
