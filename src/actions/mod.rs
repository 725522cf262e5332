//! The customization actions and their argument language.
//!
//! Each action is described by an [`ActionSpec`]: a dashed user-facing name,
//! its parameters, and a handler driving the session-public engine
//! operations. The command line is an ordered list of `--action arg k=v ...`
//! groups; YAML invocation binds the same parameters by name.
//!
//! Handlers live in the submodules:
//! - `misc` - rootfs/squashfs/cmdline/initrd plumbing, shell, cp
//! - `pool` - apt pool maintenance (debs, packages, signing)
//! - `snap` - snap seeding
//! - `kernel` - kernel replacement

mod kernel;
mod misc;
mod pool;
mod snap;

use anyhow::Result;
use std::collections::HashMap;

use crate::error::EditError;
use crate::session::Session;

/// How a parameter binds and converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Bool,
    /// Collects all excess positional arguments; must be last, and may not
    /// be passed by name.
    List,
}

#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
    /// Textual default; None makes the parameter required (List parameters
    /// default to empty).
    pub default: Option<&'static str>,
}

impl Param {
    const fn required(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Str,
            default: None,
        }
    }

    const fn optional(name: &'static str, default: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Str,
            default: Some(default),
        }
    }

    const fn flag(name: &'static str, default: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Bool,
            default: Some(default),
        }
    }

    const fn list(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::List,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Str(String),
    Bool(bool),
    List(Vec<String>),
}

/// Bound arguments for one action invocation.
#[derive(Debug, Clone, Default)]
pub struct ActionArgs {
    values: HashMap<&'static str, ArgValue>,
}

impl ActionArgs {
    pub fn str(&self, name: &str) -> &str {
        match self.values.get(name) {
            Some(ArgValue::Str(s)) => s,
            other => panic!("parameter {name} not bound as string: {other:?}"),
        }
    }

    pub fn opt_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        match self.values.get(name) {
            Some(ArgValue::Bool(b)) => *b,
            other => panic!("parameter {name} not bound as bool: {other:?}"),
        }
    }

    pub fn list(&self, name: &str) -> &[String] {
        match self.values.get(name) {
            Some(ArgValue::List(items)) => items,
            _ => &[],
        }
    }

    pub(crate) fn insert(&mut self, name: &'static str, value: ArgValue) {
        self.values.insert(name, value);
    }

    /// Render bound values for the progress line.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .values
            .iter()
            .map(|(name, value)| match value {
                ArgValue::Str(s) => format!("{name}={s}"),
                ArgValue::Bool(b) => format!("{name}={b}"),
                ArgValue::List(items) => format!("{name}={items:?}"),
            })
            .collect();
        parts.sort();
        parts.join(" ")
    }
}

/// `on`, `yes` and `true` (any case) parse as true, everything else false.
fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "on" | "yes" | "true")
}

fn convert(kind: ParamKind, raw: &str) -> ArgValue {
    match kind {
        ParamKind::Str => ArgValue::Str(raw.to_string()),
        ParamKind::Bool => ArgValue::Bool(parse_bool(raw)),
        ParamKind::List => ArgValue::List(vec![raw.to_string()]),
    }
}

#[derive(Debug)]
pub struct ActionSpec {
    pub name: &'static str,
    pub params: &'static [Param],
    pub run: fn(&Session, &ActionArgs) -> Result<()>,
}

/// Every action, in help order.
pub const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "setup-rootfs",
        params: &[Param::optional("target", "rootfs")],
        run: misc::setup_rootfs,
    },
    ActionSpec {
        name: "shell",
        params: &[Param::optional("command", "")],
        run: misc::shell,
    },
    ActionSpec {
        name: "cp",
        params: &[Param::required("source"), Param::required("dest")],
        run: misc::cp,
    },
    ActionSpec {
        name: "add-cmdline-arg",
        params: &[Param::required("arg"), Param::flag("persist", "true")],
        run: misc::add_cmdline_arg,
    },
    ActionSpec {
        name: "edit-squashfs",
        params: &[
            Param::required("squash_name"),
            Param::flag("add_sys_mounts", "true"),
        ],
        run: misc::edit_squashfs,
    },
    ActionSpec {
        name: "add-autoinstall-config",
        params: &[Param::required("autoinstall_config")],
        run: misc::add_autoinstall_config,
    },
    ActionSpec {
        name: "unpack-initrd",
        params: &[Param::optional("target", "initrd")],
        run: misc::unpack_initrd,
    },
    ActionSpec {
        name: "inject-snap",
        params: &[Param::required("snap"), Param::optional("channel", "stable")],
        run: snap::inject_snap,
    },
    ActionSpec {
        name: "add-snap-from-store",
        params: &[
            Param::required("snap_name"),
            Param::optional("channel", "stable"),
        ],
        run: snap::add_snap_from_store,
    },
    ActionSpec {
        name: "add-debs-to-pool",
        params: &[Param::list("debs")],
        run: pool::add_debs_to_pool,
    },
    ActionSpec {
        name: "add-packages-to-pool",
        params: &[Param::list("packages")],
        run: pool::add_packages_to_pool,
    },
    ActionSpec {
        name: "install-debs",
        params: &[Param::list("debs")],
        run: pool::install_debs,
    },
    ActionSpec {
        name: "sign-pool",
        params: &[Param::required("key")],
        run: pool::sign_pool,
    },
    ActionSpec {
        name: "replace-kernel",
        params: &[Param::required("kernel_package")],
        run: kernel::replace_kernel,
    },
];

pub fn lookup(name: &str) -> Option<&'static ActionSpec> {
    ACTIONS.iter().find(|spec| spec.name == name)
}

fn arg_error(action: &str, message: impl AsRef<str>) -> anyhow::Error {
    EditError::Arg(format!("{action}: {}", message.as_ref())).into()
}

/// Bind raw tokens to an action's parameters.
///
/// Tokens of the form `key=value` bind by name when `key` names a
/// parameter; everything else binds positionally, with a trailing List
/// parameter absorbing the excess.
pub fn bind_args(spec: &ActionSpec, raw: &[String]) -> Result<ActionArgs> {
    let mut args = ActionArgs::default();
    let mut pos = 0usize;

    for token in raw {
        if let Some((key, value)) = token.split_once('=') {
            if let Some(param) = spec.params.iter().find(|p| p.name == key) {
                if param.kind == ParamKind::List {
                    return Err(arg_error(
                        spec.name,
                        format!("list argument {key} may not be passed by name"),
                    ));
                }
                if args.values.contains_key(param.name) {
                    return Err(arg_error(spec.name, format!("multiple values for {key}")));
                }
                args.insert(param.name, convert(param.kind, value));
                continue;
            }
        }

        // Positional: skip parameters already bound by name.
        while pos < spec.params.len()
            && spec.params[pos].kind != ParamKind::List
            && args.values.contains_key(spec.params[pos].name)
        {
            pos += 1;
        }
        if pos >= spec.params.len() {
            return Err(arg_error(spec.name, "too many arguments"));
        }
        let param = &spec.params[pos];
        if param.kind == ParamKind::List {
            if let ArgValue::List(items) = args
                .values
                .entry(param.name)
                .or_insert_with(|| ArgValue::List(Vec::new()))
            {
                items.push(token.clone());
            }
        } else {
            args.insert(param.name, convert(param.kind, token));
            pos += 1;
        }
    }

    fill_defaults(spec, &mut args)?;
    Ok(args)
}

/// Apply defaults and enforce required parameters.
pub fn fill_defaults(spec: &ActionSpec, args: &mut ActionArgs) -> Result<()> {
    for param in spec.params {
        if args.values.contains_key(param.name) {
            continue;
        }
        match (param.kind, param.default) {
            (ParamKind::List, _) => {
                args.insert(param.name, ArgValue::List(Vec::new()));
            }
            (_, Some(default)) => {
                args.insert(param.name, convert(param.kind, default));
            }
            (_, None) => {
                return Err(arg_error(
                    spec.name,
                    format!("missing required argument {}", param.name),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> &'static ActionSpec {
        lookup(name).unwrap()
    }

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_positional_binding() {
        let args = bind_args(spec("cp"), &strings(&["a.deb", "new/iso/a.deb"])).unwrap();
        assert_eq!(args.str("source"), "a.deb");
        assert_eq!(args.str("dest"), "new/iso/a.deb");
    }

    #[test]
    fn test_named_binding_and_defaults() {
        let args = bind_args(spec("add-cmdline-arg"), &strings(&["arg=autoinstall"])).unwrap();
        assert_eq!(args.str("arg"), "autoinstall");
        assert!(args.flag("persist"));
    }

    #[test]
    fn test_bool_conversion() {
        for (raw, expected) in [("on", true), ("Yes", true), ("true", true), ("off", false), ("0", false)] {
            let args = bind_args(
                spec("add-cmdline-arg"),
                &["autoinstall".to_string(), format!("persist={raw}")],
            )
            .unwrap();
            assert_eq!(args.flag("persist"), expected, "raw={raw}");
        }
    }

    #[test]
    fn test_duplicate_argument_rejected() {
        let err = bind_args(
            spec("add-cmdline-arg"),
            &strings(&["autoinstall", "arg=again"]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiple values for arg"));
        assert!(err.to_string().starts_with("add-cmdline-arg:"));
    }

    #[test]
    fn test_too_many_arguments() {
        let err = bind_args(spec("cp"), &strings(&["a", "b", "c"])).unwrap_err();
        assert!(err.to_string().contains("too many arguments"));
    }

    #[test]
    fn test_list_collects_excess_positionals() {
        let args = bind_args(spec("add-debs-to-pool"), &strings(&["a.deb", "b.deb"])).unwrap();
        assert_eq!(args.list("debs"), &["a.deb".to_string(), "b.deb".to_string()]);
    }

    #[test]
    fn test_list_may_be_empty() {
        let args = bind_args(spec("add-debs-to-pool"), &[]).unwrap();
        assert!(args.list("debs").is_empty());
    }

    #[test]
    fn test_list_by_name_rejected() {
        let err = bind_args(spec("add-debs-to-pool"), &strings(&["debs=a.deb"])).unwrap_err();
        assert!(err.to_string().contains("may not be passed by name"));
    }

    #[test]
    fn test_missing_required_argument() {
        let err = bind_args(spec("cp"), &strings(&["only-source"])).unwrap_err();
        assert!(err.to_string().contains("missing required argument dest"));
    }

    #[test]
    fn test_positional_value_containing_equals() {
        // "layerfs-path=..." is not a parameter name, so it binds
        // positionally to arg.
        let args = bind_args(
            spec("add-cmdline-arg"),
            &strings(&["layerfs-path=minimal.squashfs"]),
        )
        .unwrap();
        assert_eq!(args.str("arg"), "layerfs-path=minimal.squashfs");
    }
}
