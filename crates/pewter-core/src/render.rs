//! Template compilation and the renderer registry.
//!
//! Every template-carrying object merges its template list with the
//! engine's shared root set at validation time; the merged set plus a
//! parameter context becomes a list of [`Renderer`]s. Renderers are
//! handed to the virtual FS after the owning transaction commits and
//! produce their bytes on demand, so rendering is always pure with
//! respect to `(object, machine, root set)` as captured at validation.

use crate::request_tracker::Tx;
use crate::CoreError;
use minijinja::Environment;
use pewter_schema::{Machine, TemplateInfo, Validation};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A renderable artifact bound to a virtual path.
#[derive(Clone)]
pub struct Renderer {
    pub path: String,
    pub name: String,
    templates: Arc<BTreeMap<String, String>>,
    context: Arc<serde_json::Value>,
}

impl Renderer {
    pub fn render(&self) -> Result<Vec<u8>, CoreError> {
        let env = build_env(&self.templates)?;
        let tmpl = env.get_template(&self.name)?;
        let out = tmpl.render(&*self.context)?;
        Ok(out.into_bytes())
    }
}

/// Compile a named template set into an environment.
pub(crate) fn build_env(
    templates: &BTreeMap<String, String>,
) -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    for (name, source) in templates {
        env.add_template_owned(name.clone(), source.clone())?;
    }
    Ok(env)
}

/// Syntax-check a single template source.
pub(crate) fn check_template(source: &str) -> Result<(), minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("probe", source)?;
    Ok(())
}

/// Merge an object's template list over the shared root set.
///
/// Inline `contents` win; a non-empty `id` pulls the referenced shared
/// template out of the root set. Structural problems (missing name,
/// unknown id, bad syntax, missing path where one is required) land on
/// the object's validation state.
pub(crate) fn merge_templates(
    root: &BTreeMap<String, String>,
    infos: &[TemplateInfo],
    require_path: bool,
    v: &mut Validation,
) -> Arc<BTreeMap<String, String>> {
    let mut merged = root.clone();
    for (i, info) in infos.iter().enumerate() {
        if info.name.is_empty() {
            v.error(format!("template[{i}] has no name"));
            continue;
        }
        if require_path && info.path.is_empty() {
            v.error(format!("template[{i}] ({}) needs a path", info.name));
        }
        let source = if !info.id.is_empty() {
            match root.get(&info.id) {
                Some(contents) => contents.clone(),
                None => {
                    v.error(format!(
                        "template[{i}] ({}) references unknown template {}",
                        info.name, info.id
                    ));
                    continue;
                }
            }
        } else {
            info.contents.clone()
        };
        if let Err(e) = check_template(&source) {
            v.error(format!("template[{i}] ({}) does not parse: {e}", info.name));
            continue;
        }
        merged.insert(info.name.clone(), source);
    }
    Arc::new(merged)
}

fn clean_virtual_path(p: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    format!("/{}", out.join("/"))
}

fn machine_context(m: &Machine, cur_mac: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "name": m.name,
        "uuid": m.uuid,
        "arch": m.arch,
        "boot_env": m.boot_env,
        "stage": m.stage,
        "hardware_addrs": m.hardware_addrs,
        "mac_addr": cur_mac.unwrap_or_default(),
    })
}

/// Build the renderer set for one object against an optional machine.
///
/// An object with required params cannot render without a machine to
/// resolve them against. A path template that mentions the machine's
/// MAC address expands to one renderer per hardware address.
pub(crate) fn make_renderers(
    tx: &Tx<'_>,
    obj_name: &str,
    infos: &[TemplateInfo],
    required_params: &[String],
    templates: Arc<BTreeMap<String, String>>,
    machine: Option<&Machine>,
    v: &mut Validation,
) -> Vec<Renderer> {
    if !required_params.is_empty() && machine.is_none() {
        v.error("no machine to render against");
        return Vec::new();
    }

    let params = match machine {
        Some(m) => tx.get_params(&crate::models::Model::Machine(m.clone()), true, true),
        None => BTreeMap::new(),
    };
    for rp in required_params {
        if !params.contains_key(rp) {
            v.error(format!("required parameter {rp} is not set"));
        }
    }

    let mut out = Vec::new();
    let mut emit = |info: &TemplateInfo, cur_mac: Option<&str>, v: &mut Validation| {
        let ctx = serde_json::json!({
            "env": { "name": obj_name },
            "machine": machine.map(|m| machine_context(m, cur_mac)),
            "params": &params,
        });
        let path = match render_one(&templates, &info.path, &ctx) {
            Ok(p) => p,
            Err(e) => {
                v.error(format!("template {}: path does not render: {e}", info.name));
                return;
            }
        };
        if path == "/" {
            v.error(format!("template {}: path renders empty", info.name));
            return;
        }
        out.push(Renderer {
            path,
            name: info.name.clone(),
            templates: templates.clone(),
            context: Arc::new(ctx),
        });
    };

    for info in infos {
        if info.name.is_empty() || info.path.is_empty() {
            // structural problems already recorded by merge_templates
            continue;
        }
        let per_mac = info.path.contains("machine.mac_addr");
        match machine {
            Some(m) if per_mac => {
                for mac in &m.hardware_addrs {
                    emit(info, Some(mac), v);
                }
            }
            _ => emit(info, None, v),
        }
    }
    out
}

fn render_one(
    templates: &BTreeMap<String, String>,
    path_tmpl: &str,
    ctx: &serde_json::Value,
) -> Result<String, minijinja::Error> {
    let env = build_env(templates)?;
    let rendered = env.render_str(path_tmpl, ctx)?;
    Ok(clean_virtual_path(rendered.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_template_accepts_valid_syntax() {
        assert!(check_template("kernel {{ params.kernel }}").is_ok());
        assert!(check_template("{% if machine %}x{% endif %}").is_ok());
    }

    #[test]
    fn check_template_rejects_bad_syntax() {
        assert!(check_template("{% if x %}unclosed").is_err());
    }

    #[test]
    fn merge_prefers_inline_contents() {
        let mut root = BTreeMap::new();
        root.insert("shared".to_owned(), "root version".to_owned());
        let infos = vec![TemplateInfo {
            name: "shared".to_owned(),
            path: "/x".to_owned(),
            contents: "local version".to_owned(),
            ..TemplateInfo::default()
        }];
        let mut v = Validation::default();
        let merged = merge_templates(&root, &infos, true, &mut v);
        assert!(!v.has_errors());
        assert_eq!(merged.get("shared").unwrap(), "local version");
    }

    #[test]
    fn merge_resolves_shared_id() {
        let mut root = BTreeMap::new();
        root.insert("ipxe-base".to_owned(), "chain {{ env.name }}".to_owned());
        let infos = vec![TemplateInfo {
            name: "ipxe".to_owned(),
            path: "/ipxe".to_owned(),
            id: "ipxe-base".to_owned(),
            ..TemplateInfo::default()
        }];
        let mut v = Validation::default();
        let merged = merge_templates(&root, &infos, true, &mut v);
        assert!(!v.has_errors());
        assert_eq!(merged.get("ipxe").unwrap(), "chain {{ env.name }}");
    }

    #[test]
    fn merge_flags_unknown_id_and_missing_path() {
        let root = BTreeMap::new();
        let infos = vec![TemplateInfo {
            name: "ipxe".to_owned(),
            id: "nope".to_owned(),
            ..TemplateInfo::default()
        }];
        let mut v = Validation::default();
        merge_templates(&root, &infos, true, &mut v);
        assert_eq!(v.errors.len(), 2);
        assert!(v.errors[0].contains("needs a path"));
        assert!(v.errors[1].contains("unknown template"));
    }

    #[test]
    fn merge_flags_syntax_errors() {
        let root = BTreeMap::new();
        let infos = vec![TemplateInfo {
            name: "broken".to_owned(),
            path: "/b".to_owned(),
            contents: "{% for %}".to_owned(),
            ..TemplateInfo::default()
        }];
        let mut v = Validation::default();
        merge_templates(&root, &infos, true, &mut v);
        assert_eq!(v.errors.len(), 1);
        assert!(v.errors[0].contains("does not parse"));
    }

    #[test]
    fn clean_virtual_path_normalizes() {
        assert_eq!(clean_virtual_path("a/b"), "/a/b");
        assert_eq!(clean_virtual_path("/a//b/./c"), "/a/b/c");
        assert_eq!(clean_virtual_path("/a/../b"), "/b");
    }
}
