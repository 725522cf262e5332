//! Parsing the ordered action list, from command-line tokens or YAML.
//!
//! The token language: `--action-name` starts an action, everything up to
//! the next `--` token is its arguments. `key=value` binds by name when
//! `key` names a parameter of the action. The YAML form is a list of maps,
//! each carrying a `name` key plus keyword arguments.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::actions::{self, ActionArgs, ActionSpec, ArgValue, ParamKind};
use crate::error::EditError;

/// One action invocation, ready to run.
#[derive(Debug)]
pub struct Call {
    pub spec: &'static ActionSpec,
    pub args: ActionArgs,
}

/// Parse the raw trailing tokens of the command line.
pub fn parse_tokens(tokens: &[String]) -> Result<Vec<Call>> {
    let mut calls = Vec::new();
    let mut current: Option<&'static ActionSpec> = None;
    let mut raw: Vec<String> = Vec::new();

    let mut flush = |current: &mut Option<&'static ActionSpec>,
                     raw: &mut Vec<String>,
                     calls: &mut Vec<Call>|
     -> Result<()> {
        if let Some(spec) = current.take() {
            let args = actions::bind_args(spec, raw)?;
            calls.push(Call { spec, args });
            raw.clear();
        }
        Ok(())
    };

    for token in tokens {
        if let Some(name) = token.strip_prefix("--") {
            flush(&mut current, &mut raw, &mut calls)?;
            let spec = actions::lookup(name)
                .ok_or_else(|| EditError::Arg(format!("unknown action '{name}'")))?;
            current = Some(spec);
        } else if current.is_none() {
            return Err(EditError::Arg(format!("no action specified for '{token}'")).into());
        } else {
            raw.push(token.clone());
        }
    }
    flush(&mut current, &mut raw, &mut calls)?;
    Ok(calls)
}

/// Parse an action list from a YAML file: a sequence of maps, each with a
/// `name` key naming the action; remaining keys bind parameters by name.
pub fn parse_yaml(path: &Path) -> Result<Vec<Call>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    let items = doc
        .as_sequence()
        .ok_or_else(|| EditError::Arg("action YAML must be a list".to_string()))?;

    let mut calls = Vec::new();
    for item in items {
        let mapping = item
            .as_mapping()
            .ok_or_else(|| EditError::Arg("each action must be a map".to_string()))?;
        let mut name = None;
        let mut kvs: Vec<(&str, &serde_yaml::Value)> = Vec::new();
        for (key, value) in mapping {
            let key = key
                .as_str()
                .ok_or_else(|| EditError::Arg("action keys must be strings".to_string()))?;
            if key == "name" {
                name = value.as_str();
            } else {
                kvs.push((key, value));
            }
        }
        let name =
            name.ok_or_else(|| EditError::Arg("action entry without a name".to_string()))?;
        let spec = actions::lookup(name)
            .ok_or_else(|| EditError::Arg(format!("unknown action '{name}'")))?;

        let mut args = ActionArgs::default();
        for (key, value) in kvs {
            let param = spec
                .params
                .iter()
                .find(|p| p.name == key)
                .ok_or_else(|| {
                    EditError::Arg(format!("{}: unknown argument {key}", spec.name))
                })?;
            args.insert(param.name, yaml_value(spec, param.kind, key, value)?);
        }
        actions::fill_defaults(spec, &mut args)?;
        calls.push(Call { spec, args });
    }
    Ok(calls)
}

fn yaml_value(
    spec: &ActionSpec,
    kind: ParamKind,
    key: &str,
    value: &serde_yaml::Value,
) -> Result<ArgValue> {
    let type_error = || {
        anyhow::Error::from(EditError::Arg(format!(
            "{}: bad value for {key}",
            spec.name
        )))
    };
    match kind {
        ParamKind::Str => match value {
            serde_yaml::Value::String(s) => Ok(ArgValue::Str(s.clone())),
            serde_yaml::Value::Number(n) => Ok(ArgValue::Str(n.to_string())),
            _ => Err(type_error()),
        },
        ParamKind::Bool => match value {
            serde_yaml::Value::Bool(b) => Ok(ArgValue::Bool(*b)),
            serde_yaml::Value::String(s) => Ok(ArgValue::Bool(matches!(
                s.to_ascii_lowercase().as_str(),
                "on" | "yes" | "true"
            ))),
            _ => Err(type_error()),
        },
        ParamKind::List => {
            let seq = value.as_sequence().ok_or_else(type_error)?;
            let mut items = Vec::new();
            for entry in seq {
                items.push(entry.as_str().ok_or_else(type_error)?.to_string());
            }
            Ok(ArgValue::List(items))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_ordered_actions() {
        let calls = parse_tokens(&strings(&[
            "--add-cmdline-arg",
            "autoinstall",
            "persist=false",
            "--edit-squashfs",
            "filesystem",
        ]))
        .unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].spec.name, "add-cmdline-arg");
        assert!(!calls[0].args.flag("persist"));
        assert_eq!(calls[1].spec.name, "edit-squashfs");
        assert!(calls[1].args.flag("add_sys_mounts"));
    }

    #[test]
    fn test_unknown_action() {
        let err = parse_tokens(&strings(&["--frobnicate"])).unwrap_err();
        assert!(err.to_string().contains("unknown action 'frobnicate'"));
    }

    #[test]
    fn test_positional_without_action() {
        let err = parse_tokens(&strings(&["stray"])).unwrap_err();
        assert!(err.to_string().contains("no action specified for 'stray'"));
    }

    #[test]
    fn test_empty_token_list() {
        assert!(parse_tokens(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_yaml_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.yaml");
        fs::write(
            &path,
            "- name: add-cmdline-arg\n  arg: autoinstall\n  persist: false\n- name: add-debs-to-pool\n  debs: [a.deb, b.deb]\n",
        )
        .unwrap();
        let calls = parse_yaml(&path).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args.str("arg"), "autoinstall");
        assert!(!calls[0].args.flag("persist"));
        assert_eq!(calls[1].args.list("debs").len(), 2);
    }

    #[test]
    fn test_parse_yaml_rejects_unknown_argument() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.yaml");
        fs::write(&path, "- name: cp\n  source: a\n  dest: b\n  mode: fast\n").unwrap();
        let err = parse_yaml(&path).unwrap_err();
        assert!(err.to_string().contains("cp: unknown argument mode"));
    }
}
