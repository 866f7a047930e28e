//! Command-line handling.
//!
//! The wrapper forwards every nginx flag verbatim; the only argument it
//! interprets is `-c` (in any combined short-flag form ending in `c`),
//! whose value is absolutized and withheld so the dumped config can be
//! substituted when nginx is started.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::DEFAULT_CONF;

/// The rewritten invocation: which config to parse, which binary to run,
/// and the arguments to forward.
#[derive(Debug, PartialEq, Eq)]
pub struct NginxArgs {
    pub conf: PathBuf,
    pub bin: String,
    pub args: Vec<String>,
}

/// Split `-c <path>` out of `args`. A combined short flag ending in `c`
/// (`-xc path`) is split into its remainder (`-x`) plus the config path.
/// Absent `-c`, the compiled-in default config is used. An empty `bin`
/// selects `nginx`.
pub fn parse_args(bin: &str, args: &[String]) -> Result<NginxArgs> {
    let mut conf_idx = None;
    for (i, arg) in args.iter().enumerate() {
        if arg.is_empty() {
            continue;
        }
        if arg.starts_with('-') && arg.ends_with('c') {
            if i + 1 >= args.len() {
                bail!("the -c argument requires a configuration file");
            }
            conf_idx = Some(i);
            break;
        }
    }

    let bin = if bin.is_empty() { "nginx" } else { bin }.to_string();
    match conf_idx {
        None => Ok(NginxArgs {
            conf: PathBuf::from(DEFAULT_CONF),
            bin,
            args: args.to_vec(),
        }),
        Some(i) => {
            let conf = std::path::absolute(&args[i + 1])?;
            let mut nargs = args[..i].to_vec();
            let flag = &args[i];
            if flag != "-c" {
                nargs.push(flag[..flag.len() - 1].to_string());
            }
            nargs.extend_from_slice(&args[i + 2..]);
            Ok(NginxArgs {
                conf,
                bin,
                args: nargs,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extracts_dash_c() {
        let parsed = parse_args("", &strs(&["-c", "foo", "bar"])).unwrap();
        assert_eq!(parsed.conf, std::path::absolute("foo").unwrap());
        assert_eq!(parsed.bin, "nginx");
        assert_eq!(parsed.args, strs(&["bar"]));
    }

    #[test]
    fn test_splits_combined_short_flag() {
        let parsed = parse_args("x", &strs(&["-xc", "foo"])).unwrap();
        assert_eq!(parsed.conf, std::path::absolute("foo").unwrap());
        assert_eq!(parsed.bin, "x");
        assert_eq!(parsed.args, strs(&["-x"]));
    }

    #[test]
    fn test_defaults_without_dash_c() {
        let parsed = parse_args("x", &strs(&["foo"])).unwrap();
        assert_eq!(parsed.conf, PathBuf::from(DEFAULT_CONF));
        assert_eq!(parsed.bin, "x");
        assert_eq!(parsed.args, strs(&["foo"]));
    }

    #[test]
    fn test_dangling_dash_c_is_an_error() {
        assert!(parse_args("", &strs(&["-c"])).is_err());
    }
}
