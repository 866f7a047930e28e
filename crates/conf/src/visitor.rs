//! Depth-first traversal with mutation-safe iteration.
//!
//! Visitors get begin/end hooks for the tree, each config file, and each
//! block, plus one hook per directive. Hooks steer traversal through
//! [`Flow`]: `SkipLevel` stops walking the current scope (its end hook
//! still fires), `SkipAll` abandons the whole traversal (the tree-end hook
//! still fires). Child lists are snapshotted before iteration, so a hook
//! that deletes or replaces the directive it was called for does not skip
//! siblings.

use anyhow::Result;

use crate::directive::{ConfigId, Node, NodeId, Tree, TreeData};

/// Traversal control returned by visitor hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Skip the children at the current scope.
    SkipLevel,
    /// Abort the entire traversal.
    SkipAll,
}

/// Visitor over a configuration tree. All hooks default to `Continue`.
#[allow(unused_variables)]
pub trait Visitor {
    fn tree_begin(&mut self, data: &mut TreeData) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn tree_end(&mut self, data: &mut TreeData) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn config_begin(&mut self, data: &mut TreeData, conf: ConfigId) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn config_end(&mut self, data: &mut TreeData, conf: ConfigId) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn block_begin(&mut self, data: &mut TreeData, block: NodeId) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn block_end(&mut self, data: &mut TreeData, block: NodeId) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn directive(&mut self, data: &mut TreeData, dire: NodeId) -> Result<Flow> {
        Ok(Flow::Continue)
    }
}

/// Out-of-band traversal interruption: either `SkipAll` or a hook error.
enum Interrupt {
    SkipAll,
    Err(anyhow::Error),
}

type Walk = std::result::Result<(), Interrupt>;

impl Tree {
    /// Walk the tree depth-first under the mutation lock.
    pub fn accept(&self, visitor: &mut dyn Visitor) -> Result<()> {
        self.change(|data| walk(data, visitor))
    }
}

/// Walk an already-locked arena.
pub fn walk(data: &mut TreeData, visitor: &mut dyn Visitor) -> Result<()> {
    let begun = match visitor.tree_begin(data) {
        Ok(Flow::Continue) => true,
        Ok(Flow::SkipLevel) | Ok(Flow::SkipAll) => false,
        Err(e) => {
            // The tree-end hook still fires; the begin error wins.
            let _ = visitor.tree_end(data);
            return Err(e);
        }
    };
    let root = data.root();
    let walked = if begun {
        visit_config(data, visitor, root)
    } else {
        Ok(())
    };
    let end = visitor.tree_end(data);
    match walked {
        Ok(()) | Err(Interrupt::SkipAll) => {}
        Err(Interrupt::Err(e)) => return Err(e),
    }
    // SkipLevel and SkipAll mean nothing at the very end of the traversal.
    end.map(|_| ())
}

fn visit_config(data: &mut TreeData, visitor: &mut dyn Visitor, conf: ConfigId) -> Walk {
    let begun = match visitor.config_begin(data, conf) {
        Ok(Flow::Continue) => Ok(true),
        Ok(Flow::SkipLevel) => Ok(false),
        Ok(Flow::SkipAll) => Err(Interrupt::SkipAll),
        Err(e) => Err(Interrupt::Err(e)),
    };
    let walked = match begun {
        Ok(true) => {
            let children = data.config(conf).children.clone();
            visit_children(data, visitor, &children)
        }
        Ok(false) => Ok(()),
        Err(i) => Err(i),
    };
    let end = visitor.config_end(data, conf);
    finish_scope(walked, end)
}

fn visit_children(data: &mut TreeData, visitor: &mut dyn Visitor, children: &[NodeId]) -> Walk {
    for &id in children {
        match visitor.directive(data, id) {
            Ok(Flow::Continue) => {}
            Ok(Flow::SkipLevel) => return Ok(()),
            Ok(Flow::SkipAll) => return Err(Interrupt::SkipAll),
            Err(e) => return Err(Interrupt::Err(e)),
        }
        descend(data, visitor, id)?;
    }
    Ok(())
}

fn descend(data: &mut TreeData, visitor: &mut dyn Visitor, id: NodeId) -> Walk {
    enum Step {
        Leaf,
        Block,
        Include(Vec<ConfigId>),
        Deferred(NodeId),
    }
    let step = match data.node(id) {
        Node::Simple(_) => Step::Leaf,
        Node::Block(_) => Step::Block,
        Node::Include(inc) => Step::Include(inc.includes.clone()),
        Node::Deferred(d) => Step::Deferred(d.inner),
    };
    match step {
        Step::Leaf => Ok(()),
        Step::Block => visit_block(data, visitor, id),
        Step::Include(subs) => {
            for sub in subs {
                visit_config(data, visitor, sub)?;
            }
            Ok(())
        }
        Step::Deferred(inner) => descend(data, visitor, inner),
    }
}

fn visit_block(data: &mut TreeData, visitor: &mut dyn Visitor, block: NodeId) -> Walk {
    let begun = match visitor.block_begin(data, block) {
        Ok(Flow::Continue) => Ok(true),
        Ok(Flow::SkipLevel) => Ok(false),
        Ok(Flow::SkipAll) => Err(Interrupt::SkipAll),
        Err(e) => Err(Interrupt::Err(e)),
    };
    let walked = match begun {
        Ok(true) => {
            let children = match data.node(block) {
                Node::Block(b) => b.children.clone(),
                _ => Vec::new(),
            };
            visit_children(data, visitor, &children)
        }
        Ok(false) => Ok(()),
        Err(i) => Err(i),
    };
    let end = visitor.block_end(data, block);
    finish_scope(walked, end)
}

/// Combine a scope's walk result with its end hook: a walk interruption
/// wins, then an end-hook error or `SkipAll`; `SkipLevel` from an end hook
/// is meaningless and ignored.
fn finish_scope(walked: Walk, end: Result<Flow>) -> Walk {
    match walked {
        Err(i) => Err(i),
        Ok(()) => match end {
            Ok(Flow::SkipAll) => Err(Interrupt::SkipAll),
            Ok(_) => Ok(()),
            Err(e) => Err(Interrupt::Err(e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        delete_all: bool,
        skip_block: Option<String>,
        stop_at: Option<String>,
    }

    impl Visitor for Recorder {
        fn tree_begin(&mut self, _data: &mut TreeData) -> Result<Flow> {
            self.events.push("tree+".into());
            Ok(Flow::Continue)
        }
        fn tree_end(&mut self, _data: &mut TreeData) -> Result<Flow> {
            self.events.push("tree-".into());
            Ok(Flow::Continue)
        }
        fn block_begin(&mut self, data: &mut TreeData, block: NodeId) -> Result<Flow> {
            let name = data.name(block).to_string();
            self.events.push(format!("{name}+"));
            if self.skip_block.as_deref() == Some(&name) {
                return Ok(Flow::SkipLevel);
            }
            Ok(Flow::Continue)
        }
        fn block_end(&mut self, data: &mut TreeData, block: NodeId) -> Result<Flow> {
            self.events.push(format!("{}-", data.name(block)));
            Ok(Flow::Continue)
        }
        fn directive(&mut self, data: &mut TreeData, dire: NodeId) -> Result<Flow> {
            let name = data.name(dire).to_string();
            self.events.push(name.clone());
            if self.stop_at.as_deref() == Some(&name) {
                return Ok(Flow::SkipAll);
            }
            if self.delete_all && data.as_simple(dire).is_some() {
                data.delete(dire);
            }
            Ok(Flow::Continue)
        }
    }

    fn tree_from(content: &str) -> crate::directive::Tree {
        let dir = tempfile::TempDir::new().unwrap();
        let main = write(dir.path(), "main.conf", content);
        parse(&main, dir.path()).unwrap()
    }

    #[test]
    fn test_visits_depth_first_with_block_hooks() {
        let tree = tree_from("a 1;\nhttp {\n  b 2;\n  server {\n    c 3;\n  }\n}\n");
        let mut rec = Recorder::default();
        tree.accept(&mut rec).unwrap();
        assert_eq!(
            rec.events,
            [
                "tree+", "a", "http", "http+", "b", "server", "server+", "c", "server-", "http-",
                "tree-"
            ]
        );
    }

    #[test]
    fn test_deleting_directives_does_not_skip_siblings() {
        let tree = tree_from("a 1;\nb 2;\nc 3;\n");
        let mut rec = Recorder {
            delete_all: true,
            ..Default::default()
        };
        tree.accept(&mut rec).unwrap();
        assert_eq!(rec.events, ["tree+", "a", "b", "c", "tree-"]);
        tree.with(|data| assert!(data.config(data.root()).children.is_empty()));
    }

    #[test]
    fn test_skip_level_fires_matching_end_hook() {
        let tree = tree_from("http {\n  a 1;\n}\nafter 2;\n");
        let mut rec = Recorder {
            skip_block: Some("http".into()),
            ..Default::default()
        };
        tree.accept(&mut rec).unwrap();
        assert_eq!(rec.events, ["tree+", "http", "http+", "http-", "after", "tree-"]);
    }

    #[test]
    fn test_skip_all_aborts_but_tree_end_runs() {
        let tree = tree_from("a 1;\nhttp {\n  b 2;\n}\nafter 3;\n");
        let mut rec = Recorder {
            stop_at: Some("b".into()),
            ..Default::default()
        };
        tree.accept(&mut rec).unwrap();
        assert_eq!(rec.events, ["tree+", "a", "http", "http+", "b", "http-", "tree-"]);
    }

    #[test]
    fn test_includes_descend_transparently() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "inner.conf", "inside 1;\n");
        let main = write(dir.path(), "main.conf", "http {\n  include inner.conf;\n}\n");
        let tree = parse(&main, dir.path()).unwrap();
        let mut rec = Recorder::default();
        tree.accept(&mut rec).unwrap();
        assert_eq!(
            rec.events,
            ["tree+", "http", "http+", "include", "inside", "http-", "tree-"]
        );
    }

    #[test]
    fn test_hook_errors_propagate() {
        struct Failing;
        impl Visitor for Failing {
            fn directive(&mut self, _data: &mut TreeData, _d: NodeId) -> Result<Flow> {
                anyhow::bail!("boom")
            }
        }
        let tree = tree_from("a 1;\n");
        let err = tree.accept(&mut Failing).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
