//! Serializer: write the tree back to disk under an output directory.
//!
//! Every config file is written to `outdir` + its absolute original path,
//! so the dumped tree mirrors the source layout. Include targets are
//! rewritten to point into the output directory and their configs are
//! dumped recursively. Deferred directives are omitted entirely.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::directive::{ConfigId, Node, NodeId, Tree, TreeData};
use crate::error::ConfError;
use crate::parse::resolve_target;

impl Tree {
    /// Dump the tree under `outdir`, returning the rewritten path of the
    /// entry config.
    pub fn dump(&self, outdir: &Path) -> Result<PathBuf, ConfError> {
        let confdir = self.confdir().to_path_buf();
        let name = self.with(|data| dump_config(data, data.root(), outdir, &confdir))?;
        debug!(path = %name.display(), "config dumped");
        Ok(name)
    }
}

fn dump_config(
    data: &TreeData,
    cid: ConfigId,
    outdir: &Path,
    confdir: &Path,
) -> Result<PathBuf, ConfError> {
    let conf = data.config(cid);
    let name = rebase(outdir, &conf.path);
    if let Some(dir) = name.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut out = BufWriter::new(fs::File::create(&name)?);
    for &child in &conf.children {
        dump_directive(data, &mut out, child, 0, outdir, confdir)?;
    }
    out.flush()?;
    Ok(name)
}

fn dump_directive(
    data: &TreeData,
    out: &mut impl Write,
    id: NodeId,
    depth: usize,
    outdir: &Path,
    confdir: &Path,
) -> Result<(), ConfError> {
    match data.node(id) {
        Node::Simple(d) => {
            indent(out, depth)?;
            write_raw(out, &d.raw)?;
            out.write_all(b";\n")?;
        }
        Node::Include(d) => {
            indent(out, depth)?;
            let target = rebase(outdir, &resolve_target(confdir, &d.target));
            writeln!(out, "include {};", escape(&target.to_string_lossy()))?;
            for &sub in &d.includes {
                dump_config(data, sub, outdir, confdir)?;
            }
        }
        Node::Block(d) => {
            indent(out, depth)?;
            write_raw(out, &d.raw)?;
            out.write_all(b" {")?;
            if d.children.is_empty() {
                out.write_all(b"}\n")?;
            } else {
                out.write_all(b"\n")?;
                for &child in &d.children {
                    dump_directive(data, out, child, depth + 1, outdir, confdir)?;
                }
                indent(out, depth)?;
                out.write_all(b"}\n")?;
            }
        }
        Node::Deferred(_) => {}
    }
    Ok(())
}

fn indent(out: &mut impl Write, depth: usize) -> std::io::Result<()> {
    for _ in 0..depth {
        out.write_all(b"\t")?;
    }
    Ok(())
}

fn write_raw(out: &mut impl Write, raw: &[String]) -> std::io::Result<()> {
    for (i, arg) in raw.iter().enumerate() {
        if i != 0 {
            out.write_all(b" ")?;
        }
        out.write_all(arg.as_bytes())?;
    }
    Ok(())
}

/// `outdir` + absolute `path`, the mirrored location of a source file.
pub fn rebase(outdir: &Path, path: &Path) -> PathBuf {
    let mut out = outdir.to_path_buf();
    for comp in path.components() {
        use std::path::Component;
        match comp {
            Component::RootDir | Component::Prefix(_) => {}
            other => out.push(other),
        }
    }
    out
}

/// Escape one argument for serialization. The empty string becomes `""`;
/// a leading quote, any `;` or `{`, and all whitespace are
/// backslash-prefixed.
pub fn escape(v: &str) -> String {
    if v.is_empty() {
        return "\"\"".to_string();
    }
    let mut b = String::with_capacity(v.len());
    for (i, r) in v.char_indices() {
        match r {
            '"' | '\'' => {
                if i == 0 {
                    b.push('\\');
                }
            }
            ';' | '{' => b.push('\\'),
            _ => {
                if r.is_whitespace() {
                    b.push('\\');
                }
            }
        }
        b.push(r);
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_escapes_arguments() {
        assert_eq!(escape(""), "\"\"");
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a b"), "a\\ b");
        assert_eq!(escape("a;b"), "a\\;b");
        assert_eq!(escape("a{b"), "a\\{b");
        assert_eq!(escape("\"quoted\""), "\\\"quoted\"");
        assert_eq!(escape("mid\"quote"), "mid\"quote");
    }

    #[test]
    fn test_dumps_nested_blocks_with_tabs() {
        let dir = tempfile::TempDir::new().unwrap();
        let main = write(
            dir.path(),
            "main.conf",
            "a 1;http{server{listen 80;}empty{}}",
        );
        let tree = parse(&main, dir.path()).unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let name = tree.dump(out.path()).unwrap();
        let got = fs::read_to_string(&name).unwrap();
        assert_eq!(
            got,
            "a 1;\nhttp {\n\tserver {\n\t\tlisten 80;\n\t}\n\tempty {}\n}\n"
        );
    }

    #[test]
    fn test_parse_dump_parse_is_structurally_stable() {
        let dir = tempfile::TempDir::new().unwrap();
        let main = write(
            dir.path(),
            "main.conf",
            "# comment\nuser  www;\nhttp {\n  server {\n    server_name 'a.com' \"b.com\";\n    root /var/w\\ ww;\n  }\n}\n",
        );
        let tree = parse(&main, dir.path()).unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let name = tree.dump(out.path()).unwrap();

        let tree2 = parse(&name, out.path()).unwrap();
        let shape1 = tree.with(shape_of);
        let shape2 = tree2.with(shape_of);
        assert_eq!(shape1, shape2);
    }

    fn shape_of(data: &TreeData) -> Vec<String> {
        let mut acc = Vec::new();
        fn walk(data: &TreeData, ids: &[NodeId], depth: usize, acc: &mut Vec<String>) {
            for &id in ids {
                match data.node(id) {
                    Node::Simple(d) => {
                        acc.push(format!("{}{} {:?}", "  ".repeat(depth), d.name, d.args))
                    }
                    Node::Block(d) => {
                        acc.push(format!("{}{} {:?} {{", "  ".repeat(depth), d.name, d.args));
                        walk(data, &d.children, depth + 1, acc);
                    }
                    Node::Include(d) => {
                        for &sub in &d.includes {
                            walk(data, &data.config(sub).children, depth, acc);
                        }
                    }
                    Node::Deferred(_) => {}
                }
            }
        }
        walk(data, &data.config(data.root()).children, 0, &mut acc);
        acc
    }

    #[test]
    fn test_rewrites_include_targets_into_outdir() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "extra.conf", "b 2;\n");
        let main = write(dir.path(), "main.conf", "include extra.conf;\n");
        let tree = parse(&main, dir.path()).unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let name = tree.dump(out.path()).unwrap();
        let got = fs::read_to_string(&name).unwrap();
        let rebased = rebase(out.path(), &dir.path().join("extra.conf"));
        assert_eq!(got, format!("include {};\n", rebased.display()));
        assert_eq!(fs::read_to_string(&rebased).unwrap(), "b 2;\n");
    }

    #[test]
    fn test_deferred_directives_are_omitted() {
        let dir = tempfile::TempDir::new().unwrap();
        let main = write(
            dir.path(),
            "main.conf",
            "keep 1;\nacme_defer hidden arg;\n",
        );
        let tree = parse(&main, dir.path()).unwrap();
        tree.change(|data| {
            let second = data.config(data.root()).children[1];
            data.defer(second);
        });
        let out = tempfile::TempDir::new().unwrap();
        let name = tree.dump(out.path()).unwrap();
        assert_eq!(fs::read_to_string(&name).unwrap(), "keep 1;\n");

        tree.change(|data| {
            let wrapper = data.config(data.root()).children[1];
            data.undefer(wrapper);
        });
        let name = tree.dump(out.path()).unwrap();
        assert_eq!(
            fs::read_to_string(&name).unwrap(),
            "keep 1;\nhidden arg;\n"
        );
    }
}
