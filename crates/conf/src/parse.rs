//! Recursive-descent parser building the multi-file configuration tree.
//!
//! Include directives are resolved while parsing: relative targets join the
//! tree's confdir, a `*` in the basename glob-expands (zero matches is
//! fine), and every file is loaded at most once per tree. The cache entry
//! is registered before the included file is parsed, so include cycles
//! terminate instead of recursing.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::directive::{
    Block, ConfigFile, ConfigId, Include, Node, NodeId, Parent, Simple, Tree, TreeData,
};
use crate::error::ConfError;
use crate::lex::{line_column, Lexer, Token, TokenKind};

/// Parse `entry` and everything it includes into a tree. Relative include
/// targets resolve against `confdir`.
pub fn parse(entry: impl AsRef<Path>, confdir: impl AsRef<Path>) -> Result<Tree, ConfError> {
    let entry = std::path::absolute(entry.as_ref())?;
    let confdir = std::path::absolute(confdir.as_ref())?;
    let data = parse_tree(&entry, &confdir)?;
    debug!(entrypoint = %entry.display(), "all configs parsed");
    Ok(Tree::new(entry, confdir, data))
}

impl Tree {
    /// Re-read every file from disk, replacing the in-memory tree.
    pub fn reparse(&self) -> Result<(), ConfError> {
        let data = parse_tree(self.entry(), self.confdir())?;
        self.swap_data(data);
        debug!(entrypoint = %self.entry().display(), "all configs parsed");
        Ok(())
    }
}

fn parse_tree(entry: &Path, confdir: &Path) -> Result<TreeData, ConfError> {
    let mut data = TreeData::default();
    let root = load_config(&mut data, confdir, entry.to_path_buf(), None, None)?;
    data.root = root;
    Ok(data)
}

fn load_config(
    data: &mut TreeData,
    confdir: &Path,
    path: PathBuf,
    parent: Option<NodeId>,
    parent_block: Option<NodeId>,
) -> Result<ConfigId, ConfError> {
    if let Some(&cid) = data.included.get(&path) {
        return Ok(cid);
    }
    let text = fs::read_to_string(&path)?;
    let cid = data.push_config(ConfigFile {
        path: path.clone(),
        text: text.clone(),
        children: Vec::new(),
        parent,
        parent_block,
    });
    data.included.insert(path, cid);

    let mut lexer = Lexer::new(&text);
    let children = parse_children(
        data,
        &mut lexer,
        cid,
        confdir,
        Parent::Config(cid),
        parent_block,
        false,
    )?;
    data.config_mut(cid).children = children;
    debug!(name = %data.config(cid).path.display(), "config parsed");
    Ok(cid)
}

fn parse_children(
    data: &mut TreeData,
    lexer: &mut Lexer<'_>,
    cid: ConfigId,
    confdir: &Path,
    parent: Parent,
    parent_block: Option<NodeId>,
    in_block: bool,
) -> Result<Vec<NodeId>, ConfError> {
    let mut children = Vec::new();
    loop {
        let Some(tok) = lexer.next_token() else {
            if in_block {
                return Err(unexpected_eof(data, cid));
            }
            return Ok(children);
        };
        match tok.kind {
            TokenKind::Punc => match tok.text.as_str() {
                ";" => {}
                "}" if in_block => return Ok(children),
                _ => return Err(unexpected(data, cid, &tok)),
            },
            TokenKind::Literal => {
                let id = parse_directive(data, lexer, cid, confdir, tok, parent, parent_block)?;
                children.push(id);
            }
        }
    }
}

fn parse_directive(
    data: &mut TreeData,
    lexer: &mut Lexer<'_>,
    cid: ConfigId,
    confdir: &Path,
    name_tok: Token,
    parent: Parent,
    parent_block: Option<NodeId>,
) -> Result<NodeId, ConfError> {
    if name_tok.value == "include" {
        return parse_include(data, lexer, cid, confdir, name_tok, parent, parent_block);
    }

    let mut args = Vec::new();
    let mut raw = vec![name_tok.text.clone()];
    let end = loop {
        let Some(tok) = lexer.next_token() else {
            return Err(unexpected_eof(data, cid));
        };
        match tok.kind {
            TokenKind::Punc => break tok,
            TokenKind::Literal => {
                args.push(tok.value);
                raw.push(tok.text);
            }
        }
    };
    match end.text.as_str() {
        ";" => Ok(data.push_node(Node::Simple(Simple {
            name: name_tok.value,
            args,
            raw,
            pos: name_tok.pos,
            conf: Some(cid),
            parent: Some(parent),
            parent_block,
        }))),
        "{" => {
            let id = data.push_node(Node::Block(Block {
                name: name_tok.value,
                args,
                raw,
                children: Vec::new(),
                pos: name_tok.pos,
                conf: Some(cid),
                parent: Some(parent),
                parent_block,
            }));
            let children = parse_children(
                data,
                lexer,
                cid,
                confdir,
                Parent::Block(id),
                Some(id),
                true,
            )?;
            match data.node_mut(id) {
                Node::Block(b) => b.children = children,
                _ => unreachable!(),
            }
            Ok(id)
        }
        _ => Err(unexpected(data, cid, &end)),
    }
}

fn parse_include(
    data: &mut TreeData,
    lexer: &mut Lexer<'_>,
    cid: ConfigId,
    confdir: &Path,
    name_tok: Token,
    parent: Parent,
    parent_block: Option<NodeId>,
) -> Result<NodeId, ConfError> {
    let Some(target_tok) = lexer.next_token() else {
        return Err(unexpected_eof(data, cid));
    };
    if target_tok.kind != TokenKind::Literal {
        return Err(unexpected(data, cid, &target_tok));
    }
    let Some(end) = lexer.next_token() else {
        return Err(unexpected_eof(data, cid));
    };
    if end.kind != TokenKind::Punc || end.text != ";" {
        return Err(unexpected(data, cid, &end));
    }

    let id = data.push_node(Node::Include(Include {
        target: target_tok.value.clone(),
        includes: Vec::new(),
        pos: name_tok.pos,
        conf: Some(cid),
        parent: Some(parent),
        parent_block,
    }));

    let target = resolve_target(confdir, &target_tok.value);
    let names = if file_name_has_glob(&target) {
        let mut names = Vec::new();
        for entry in glob::glob(&target.to_string_lossy())? {
            names.push(entry?);
        }
        names
    } else {
        vec![target]
    };
    for name in names {
        let sub = load_config(data, confdir, name, Some(id), parent_block)?;
        match data.node_mut(id) {
            Node::Include(inc) => inc.includes.push(sub),
            _ => unreachable!(),
        }
    }
    Ok(id)
}

pub(crate) fn resolve_target(confdir: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        confdir.join(target)
    }
}

fn file_name_has_glob(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().contains('*'))
        .unwrap_or(false)
}

fn unexpected(data: &TreeData, cid: ConfigId, tok: &Token) -> ConfError {
    let conf = data.config(cid);
    let (line, column) = line_column(&conf.text, tok.pos);
    ConfError::Unexpected {
        text: tok.text.clone(),
        path: conf.path.clone(),
        line,
        column,
    }
}

fn unexpected_eof(data: &TreeData, cid: ConfigId) -> ConfError {
    ConfError::UnexpectedEof {
        path: data.config(cid).path.clone(),
    }
}
