//! Boot-environment lifecycle: per-arch bookkeeping, install-repo
//! lookaside binding, on-disk availability checks, renderer fan-out,
//! ISO explosion scheduling, and the stage revalidation cascade.

use crate::fs::{FileStream, Lookaside};
use crate::iso::{self, IsoTask};
use crate::models::SideFx;
use crate::render::{make_renderers, merge_templates};
use crate::request_tracker::{AfterAction, Tx};
use crate::CoreError;
use pewter_schema::{
    arch_equal, kind, pref, supported_arch, ApiError, ArchInfo, BootEnv, Repo, Validation,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Fold the amd64 shorthand fields and the per-arch map into one
/// canonical arch table. Returns the table plus any structural errors.
pub(crate) fn regen_arches(env: &BootEnv) -> (BTreeMap<String, ArchInfo>, Vec<String>) {
    let mut arches = BTreeMap::new();
    let mut errs = Vec::new();
    if !env.kernel.is_empty() {
        arches.insert(
            "amd64".to_owned(),
            ArchInfo {
                kernel: env.kernel.clone(),
                initrds: env.initrds.clone(),
                boot_params: env.boot_params.clone(),
                iso_file: env.os.iso_file.clone(),
                sha256: env.os.iso_sha256.clone(),
                iso_url: env.os.iso_url.clone(),
            },
        );
    }
    for (name, info) in &env.os.supported_architectures {
        match supported_arch(name) {
            Some(canon) => {
                arches.insert(canon.to_owned(), info.clone());
            }
            None => errs.push(format!("unsupported architecture {name}")),
        }
    }
    for (arch, info) in &arches {
        if info.kernel.is_empty() {
            errs.push(format!("arch {arch} is missing a kernel"));
        }
        if !info.boot_params.is_empty() {
            if let Err(e) = crate::render::check_template(&info.boot_params) {
                errs.push(format!("boot params for arch {arch} do not parse: {e}"));
            }
        }
    }
    (arches, errs)
}

pub(crate) fn net_boot(env: &BootEnv, arches: &BTreeMap<String, ArchInfo>) -> bool {
    env.only_unknown || !arches.is_empty()
}

/// Resolve an arch alias against the env's canonical table.
pub(crate) fn arch_for<'a>(
    arches: &'a BTreeMap<String, ArchInfo>,
    arch: &str,
) -> Option<&'a str> {
    arches
        .keys()
        .find(|k| arch_equal(arch, k))
        .map(String::as_str)
}

fn local_path_for(file_root: &Path, env: &BootEnv, file: &str, arch: &str) -> PathBuf {
    file_root.join(env.path_for(file, arch).trim_start_matches('/'))
}

fn can_local_boot(
    file_root: &Path,
    env: &BootEnv,
    arches: &BTreeMap<String, ArchInfo>,
    arch: &str,
) -> Vec<String> {
    let mut errs = Vec::new();
    let Some(info) = arches.get(arch) else {
        return vec![format!("bootenv {}: cannot handle arch {arch}", env.name)];
    };
    let kpath = local_path_for(file_root, env, &info.kernel, arch);
    match std::fs::metadata(&kpath) {
        Err(_) => errs.push(format!(
            "bootenv {}: missing kernel {} ({}) for arch {arch}",
            env.name,
            info.kernel,
            kpath.display()
        )),
        Ok(md) if !md.is_file() => errs.push(format!(
            "bootenv {}: invalid kernel {} ({}) for arch {arch}",
            env.name,
            info.kernel,
            kpath.display()
        )),
        Ok(_) => {}
    }
    for initrd in &info.initrds {
        let ipath = local_path_for(file_root, env, initrd, arch);
        match std::fs::metadata(&ipath) {
            Err(_) => errs.push(format!(
                "bootenv {}: missing initrd {initrd} ({}) for arch {arch}",
                env.name,
                ipath.display()
            )),
            Ok(md) if !md.is_file() => errs.push(format!(
                "bootenv {}: invalid initrd {initrd} ({}) for arch {arch}",
                env.name,
                ipath.display()
            )),
            Ok(_) => {}
        }
    }
    errs
}

/// Whether this env can boot the given arch right now: an install repo
/// is bound for it, or the kernel and every initrd exist locally.
pub fn can_arch_boot(tx: &Tx, env: &BootEnv, arch: &str) -> Result<(), ApiError> {
    let (arches, _) = regen_arches(env);
    if !net_boot(env, &arches) {
        return Ok(());
    }
    let Some(our_arch) = arch_for(&arches, arch).map(str::to_owned) else {
        let mut e = ApiError::new(422, kind::VALIDATION, "bootenvs", &env.name);
        e.errorf(format!("bootenv {}: cannot handle arch {arch}", env.name));
        return Err(e);
    };
    let (repos, _) = fill_install_repos(tx, env, &arches);
    if repos.contains_key(&our_arch) {
        return Ok(());
    }
    let errs = can_local_boot(tx.dt().file_root(), env, &arches, &our_arch);
    let mut e = ApiError::new(422, kind::VALIDATION, "bootenvs", &env.name);
    e.messages = errs;
    e.into_result()
}

fn basename(p: &str) -> &str {
    p.rsplit('/').next().unwrap_or(p)
}

/// Consult the global profile's `package-repositories` param and bind
/// the first repo that can act as this env's install source. The
/// returned lookaside closures capture an immutable snapshot of the
/// binding; nothing shared is read at serve time.
fn fill_install_repos(
    tx: &Tx,
    env: &BootEnv,
    arches: &BTreeMap<String, ArchInfo>,
) -> (BTreeMap<String, Repo>, Vec<(String, Lookaside)>) {
    let mut repos = BTreeMap::new();
    let mut lookasides = Vec::new();
    if env.os.name.is_empty() {
        return (repos, lookasides);
    }
    let Some(global) = tx.raw_find("profiles", tx.dt().global_profile()) else {
        return (repos, lookasides);
    };
    let Some(raw) = tx.get_param(&global, "package-repositories", true, false) else {
        debug!("bootenv {}: no package repositories to use", env.name);
        return (repos, lookasides);
    };
    let list: Vec<Repo> = match serde_json::from_value(raw) {
        Ok(l) => l,
        Err(e) => {
            debug!("bootenv {}: package-repositories not usable: {e}", env.name);
            return (repos, lookasides);
        }
    };
    for repo in list {
        debug!("bootenv {}: considering repo {}", env.name, repo.tag);
        if !repo.install_source_for(&env.os.name) {
            continue;
        }
        let Some(real_arch) = arch_for(arches, &repo.arch).map(str::to_owned) else {
            continue;
        };
        let info = arches[&real_arch].clone();
        info!(
            "bootenv {}: using repo {} as install source for {real_arch}",
            env.name, repo.tag
        );
        let tree = env.path_for("", &real_arch);
        let local_tree = local_path_for(tx.dt().file_root(), env, "", &real_arch);
        let snapshot = LookasideSnapshot {
            repo: repo.clone(),
            tree: tree.clone(),
            local_tree,
            kernel: info.kernel,
            initrds: info.initrds,
        };
        lookasides.push((
            tree,
            Arc::new(move |p: &str| snapshot.fetch(p)) as Lookaside,
        ));
        repos.insert(real_arch, repo);
        break;
    }
    (repos, lookasides)
}

/// Everything a lookaside needs, captured at validation time.
struct LookasideSnapshot {
    repo: Repo,
    tree: String,
    local_tree: PathBuf,
    kernel: String,
    initrds: Vec<String>,
}

impl LookasideSnapshot {
    fn fetch(&self, path: &str) -> Result<Option<FileStream>, CoreError> {
        // Always use the local copy once the tree has been exploded.
        if self.local_tree.exists() {
            return Ok(None);
        }
        let mut target = format!(
            "{}{}",
            self.repo.url.trim_end_matches('/'),
            path.strip_prefix(self.tree.as_str()).unwrap_or(path)
        );
        if !self.repo.boot_loc.is_empty() {
            let boot = self.repo.boot_loc.trim_end_matches('/');
            if !self.kernel.is_empty() && path.ends_with(self.kernel.as_str()) {
                target = format!("{boot}/{}", basename(&self.kernel));
            } else if let Some(initrd) =
                self.initrds.iter().find(|i| path.ends_with(i.as_str()))
            {
                target = format!("{boot}/{}", basename(initrd));
            }
        }
        debug!("proxying {path} to {target}");
        let resp = ureq::Agent::new_with_defaults()
            .get(&target)
            .call()
            .map_err(|e| CoreError::Upstream(e.to_string()))?;
        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        Ok(Some(FileStream {
            reader: Box::new(resp.into_body().into_reader()),
            size,
        }))
    }
}

pub(crate) fn validate(tx: &Tx, env: &mut BootEnv) -> SideFx {
    let mut v = std::mem::take(&mut env.validation);
    let mut fx = SideFx::default();

    if env.name.is_empty() {
        v.error("name is required");
    }
    let (arches, arch_errs) = regen_arches(env);
    for e in arch_errs {
        v.error(e);
    }
    let root = tx.dt().template_root();
    let merged = merge_templates(&root, &env.templates, true, &mut v);

    fx.real_arches = arches;
    if !v.set_valid() {
        env.validation = v;
        return fx;
    }

    let netboot = net_boot(env, &fx.real_arches);
    if netboot && env.os.name.is_empty() {
        v.error("missing OS name");
    }
    if !env.templates.is_empty()
        && !env.kernel.is_empty()
        && env.meta.get("KernelIsLoader").map(String::as_str) != Some("true")
    {
        let seen_loader = env.templates.iter().any(|t| {
            matches!(
                t.name.as_str(),
                "pxelinux" | "pxelinux-mac" | "ipxe" | "ipxe-mac"
            )
        });
        if !seen_loader {
            v.error("missing ipxe or pxelinux template");
        }
    }
    if netboot && !env.os.name.is_empty() {
        let (repos, lookasides) = fill_install_repos(tx, env, &fx.real_arches);
        fx.install_repos = repos;
        fx.lookasides = lookasides;
    }

    if v.set_useable() {
        if env.only_unknown {
            fx.renderers = make_renderers(
                tx,
                &env.name,
                &env.templates,
                &env.required_params,
                merged.clone(),
                None,
                &mut v,
            );
        } else {
            for item in tx.store("machines").items() {
                let crate::models::Model::Machine(machine) = &**item else {
                    continue;
                };
                if machine.boot_env != env.name {
                    continue;
                }
                fx.renderers.extend(make_renderers(
                    tx,
                    &env.name,
                    &env.templates,
                    &env.required_params,
                    merged.clone(),
                    Some(machine),
                    &mut v,
                ));
            }
        }
    }

    // Availability: every arch is either backed by an install repo or
    // fully present on disk.
    let file_root = tx.dt().file_root();
    let arch_names: Vec<String> = fx.real_arches.keys().cloned().collect();
    for arch in &arch_names {
        if fx.install_repos.contains_key(arch) {
            continue;
        }
        for e in can_local_boot(file_root, env, &fx.real_arches, arch) {
            v.error(e);
        }
    }
    v.set_available();
    env.validation = v;
    fx
}

/// Pending ISO extractions for this env: skipped when the canary is in
/// place with the right SHA256, or when the ISO has not been downloaded.
pub(crate) fn iso_exploders(
    file_root: &Path,
    env: &BootEnv,
    arches: &BTreeMap<String, ArchInfo>,
    repos: &BTreeMap<String, Repo>,
) -> Vec<IsoTask> {
    let mut tasks = Vec::new();
    if env.os.name.is_empty() {
        return tasks;
    }
    for (arch, info) in arches {
        if info.iso_file.is_empty() {
            continue;
        }
        let canary = local_path_for(file_root, env, &iso::canary_name(&env.os.name), arch);
        if let Ok(content) = std::fs::read_to_string(&canary) {
            if content.trim() == info.sha256 {
                info!(
                    "explode iso: canary {} in place with proper SHA256",
                    canary.display()
                );
                continue;
            }
        }
        let iso_path = file_root.join("isos").join(&info.iso_file);
        if !iso_path.exists() {
            if let Some(repo) = repos.get(arch) {
                info!(
                    "explode iso: {} not present, falling back to install repo {}",
                    info.iso_file, repo.url
                );
            }
            continue;
        }
        tasks.push(IsoTask {
            env_name: env.name.clone(),
            os_name: env.os.name.clone(),
            iso_path,
            dest: local_path_for(file_root, env, "", arch),
            sha256: info.sha256.clone(),
        });
    }
    tasks
}

pub(crate) fn after_save(tx: &mut Tx, env: &BootEnv, fx: SideFx) {
    let name = env.name.clone();
    super::revalidate_stages(tx, move |s| s.boot_env == name);

    let tasks = iso_exploders(tx.dt().file_root(), env, &fx.real_arches, &fx.install_repos);
    if !tasks.is_empty() {
        tx.after.push(AfterAction::ExplodeIsos(tasks));
    }
    if env.validation.available && !fx.renderers.is_empty() {
        tx.after.push(AfterAction::Register(fx.renderers));
    }
    for (tree, lookaside) in fx.lookasides {
        tx.after.push(AfterAction::AddTree(tree, lookaside));
    }
}

pub(crate) fn before_delete(tx: &Tx, env: &BootEnv) -> Result<(), ApiError> {
    let mut e = ApiError::new(409, kind::STILL_IN_USE, "bootenvs", &env.name);
    let guarding_pref = if env.only_unknown {
        pref::UNKNOWN_BOOT_ENV
    } else {
        pref::DEFAULT_BOOT_ENV
    };
    if tx.pref(guarding_pref).as_deref() == Some(env.name.as_str()) {
        e.errorf(format!(
            "bootenv {} is the active {guarding_pref}, cannot remove it",
            env.name
        ));
    }
    if !env.only_unknown {
        for item in tx.store("machines").items() {
            if let crate::models::Model::Machine(m) = &**item {
                if m.boot_env == env.name {
                    e.errorf(format!("bootenv {} in use by machine {}", env.name, m.name));
                }
            }
        }
        for item in tx.store("stages").items() {
            if let crate::models::Model::Stage(s) = &**item {
                if s.boot_env == env.name {
                    e.errorf(format!("bootenv {} in use by stage {}", env.name, s.name));
                }
            }
        }
    }
    e.into_result()
}

pub(crate) fn after_delete(tx: &mut Tx, env: &BootEnv) {
    // Recompute the renderer paths this env was serving and drop them.
    let root = tx.dt().template_root();
    let mut scratch = Validation::default();
    let merged = merge_templates(&root, &env.templates, true, &mut scratch);
    let mut paths: Vec<String> = Vec::new();
    if env.only_unknown {
        paths.extend(
            make_renderers(
                tx,
                &env.name,
                &env.templates,
                &env.required_params,
                merged,
                None,
                &mut scratch,
            )
            .into_iter()
            .map(|r| r.path),
        );
    } else {
        for item in tx.store("machines").items() {
            let crate::models::Model::Machine(machine) = &**item else {
                continue;
            };
            if machine.boot_env != env.name {
                continue;
            }
            paths.extend(
                make_renderers(
                    tx,
                    &env.name,
                    &env.templates,
                    &env.required_params,
                    merged.clone(),
                    Some(machine),
                    &mut scratch,
                )
                .into_iter()
                .map(|r| r.path),
            );
        }
    }
    if !paths.is_empty() {
        tx.after.push(AfterAction::Deregister(paths));
    }

    // Prune the per-OS dynamic trees once no bootenv serves this OS.
    if env.os.name.is_empty() {
        return;
    }
    let survivors = tx.store("bootenvs").items().iter().any(|o| {
        matches!(&**o, crate::models::Model::BootEnv(b) if b.os.name == env.os.name)
    });
    if !survivors {
        let (arches, _) = regen_arches(env);
        for arch in arches.keys() {
            tx.after
                .push(AfterAction::DelTree(env.path_for("", arch)));
        }
    }
}
