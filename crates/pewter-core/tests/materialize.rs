//! Boot-environment materialization: on-disk availability, renderer
//! registration, install-repo lookaside, ISO explosion, and dynamic
//! tree lifecycle.

use pewter_core::models::bootenv::can_arch_boot;
use pewter_core::models::locks_for;
use pewter_core::{DataTracker, DtConfig, Model};
use pewter_schema::{BootEnv, Machine, OsInfo, Profile, Repo, TemplateInfo, Tmpl};
use pewter_store::{MemoryStore, SecretsStore};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

fn test_dt() -> (tempfile::TempDir, DataTracker) {
    let backing = Arc::new(MemoryStore::new());
    let file_root = tempfile::tempdir().unwrap();
    let secrets = SecretsStore::new(file_root.path().join("secrets"));
    let dt = DataTracker::new(DtConfig::new(backing, secrets, file_root.path())).unwrap();
    (file_root, dt)
}

fn ubuntu_install() -> BootEnv {
    let mut env = BootEnv::default();
    env.name = "ubuntu-install".to_owned();
    env.os = OsInfo {
        name: "ubuntu".to_owned(),
        ..OsInfo::default()
    };
    env.kernel = "linux".to_owned();
    env.initrds = vec!["initrd".to_owned()];
    env.templates = vec![TemplateInfo {
        name: "ipxe".to_owned(),
        path: "/{{ env.name }}/{{ machine.name }}.ipxe".to_owned(),
        contents: "chain {{ env.name }} for {{ machine.name }}".to_owned(),
        ..TemplateInfo::default()
    }];
    env
}

fn read_stream(fs: &pewter_core::FileSystem, path: &str) -> Vec<u8> {
    let mut stream = fs.open(path).unwrap();
    let mut buf = Vec::new();
    stream.reader.read_to_end(&mut buf).unwrap();
    buf
}

#[test]
fn bootenv_without_kernel_on_disk_is_not_available() {
    let (_root, dt) = test_dt();
    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        let saved = tx.create(Model::BootEnv(ubuntu_install())).unwrap();
        let v = saved.validation();
        assert!(v.validated);
        assert!(v.useable);
        assert!(!v.available);
        assert!(v.errors.iter().any(|e| e.contains("missing kernel")));
    });
}

#[test]
fn bootenv_becomes_available_and_registers_renderers() {
    let (root, dt) = test_dt();
    let tree = root.path().join("ubuntu/install");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("linux"), b"kernel").unwrap();
    std::fs::write(tree.join("initrd"), b"initrd").unwrap();

    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        tx.create(Model::BootEnv(ubuntu_install())).unwrap();
        let mut m = Machine::default();
        m.uuid = uuid::Uuid::new_v4();
        m.name = "node1".to_owned();
        m.boot_env = "ubuntu-install".to_owned();
        tx.create(Model::Machine(m)).unwrap();

        // Re-save so the env renders against the machine.
        let env = tx.find("bootenvs", "ubuntu-install").unwrap();
        let saved = tx.save(env).unwrap();
        assert!(saved.validation().available);
    });

    let paths = dt.fs().rendered_paths();
    assert!(paths.contains(&"/ubuntu-install/node1.ipxe".to_owned()));
    let body = read_stream(dt.fs(), "/ubuntu-install/node1.ipxe");
    assert_eq!(body, b"chain ubuntu-install for node1");
}

#[test]
fn machine_save_registers_its_own_renderers() {
    let (root, dt) = test_dt();
    let tree = root.path().join("ubuntu/install");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("linux"), b"k").unwrap();
    std::fs::write(tree.join("initrd"), b"i").unwrap();

    let mut rt = dt.request(locks_for("machines", "create"));
    rt.do_with(|tx| {
        tx.create(Model::BootEnv(ubuntu_install())).unwrap();
        let mut m = Machine::default();
        m.uuid = uuid::Uuid::new_v4();
        m.name = "node2".to_owned();
        m.boot_env = "ubuntu-install".to_owned();
        tx.create(Model::Machine(m)).unwrap();
    });
    assert!(dt
        .fs()
        .rendered_paths()
        .contains(&"/ubuntu-install/node2.ipxe".to_owned()));
}

#[test]
fn mac_templated_paths_expand_per_hardware_address() {
    let (root, dt) = test_dt();
    let tree = root.path().join("ubuntu/install");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("linux"), b"k").unwrap();
    std::fs::write(tree.join("initrd"), b"i").unwrap();

    let mut env = ubuntu_install();
    env.templates = vec![TemplateInfo {
        name: "pxelinux".to_owned(),
        path: "/pxelinux.cfg/{{ machine.mac_addr }}".to_owned(),
        contents: "default {{ env.name }}".to_owned(),
        ..TemplateInfo::default()
    }];

    let mut rt = dt.request(locks_for("machines", "create"));
    rt.do_with(|tx| {
        tx.create(Model::BootEnv(env)).unwrap();
        let mut m = Machine::default();
        m.uuid = uuid::Uuid::new_v4();
        m.name = "twin-nic".to_owned();
        m.boot_env = "ubuntu-install".to_owned();
        m.hardware_addrs = vec!["de:ad:be:ef:00:01".to_owned(), "de:ad:be:ef:00:02".to_owned()];
        tx.create(Model::Machine(m)).unwrap();
    });

    let paths = dt.fs().rendered_paths();
    assert!(paths.contains(&"/pxelinux.cfg/de:ad:be:ef:00:01".to_owned()));
    assert!(paths.contains(&"/pxelinux.cfg/de:ad:be:ef:00:02".to_owned()));
}

#[test]
fn shared_template_resolves_through_root_set() {
    let (_root, dt) = test_dt();
    let mut trt = dt.request(locks_for("templates", "create"));
    trt.do_with(|tx| {
        tx.create(Model::Tmpl(Tmpl {
            id: "ipxe-base".to_owned(),
            contents: "chain {{ env.name }}".to_owned(),
            ..Tmpl::default()
        }))
        .unwrap();
    });

    let mut env = BootEnv::default();
    env.name = "discovery".to_owned();
    env.os.name = "sledgehammer".to_owned();
    env.only_unknown = true;
    env.templates = vec![TemplateInfo {
        name: "ipxe".to_owned(),
        path: "/discovery.ipxe".to_owned(),
        id: "ipxe-base".to_owned(),
        ..TemplateInfo::default()
    }];

    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        let saved = tx.create(Model::BootEnv(env)).unwrap();
        assert!(saved.validation().available);
    });
    assert_eq!(
        read_stream(dt.fs(), "/discovery.ipxe"),
        b"chain discovery"
    );
}

#[test]
fn shared_template_delete_guarded_while_referenced() {
    let (_root, dt) = test_dt();
    let mut trt = dt.request(locks_for("templates", "create"));
    trt.do_with(|tx| {
        tx.create(Model::Tmpl(Tmpl {
            id: "used".to_owned(),
            contents: "x".to_owned(),
            ..Tmpl::default()
        }))
        .unwrap();
    });
    let mut env = BootEnv::default();
    env.name = "refs-template".to_owned();
    env.os.name = "any".to_owned();
    env.only_unknown = true;
    env.templates = vec![TemplateInfo {
        name: "boot".to_owned(),
        path: "/refs.cfg".to_owned(),
        id: "used".to_owned(),
        ..TemplateInfo::default()
    }];
    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        tx.create(Model::BootEnv(env)).unwrap();
    });

    let mut drt = dt.request(locks_for("templates", "delete"));
    drt.do_with(|tx| {
        let err = tx
            .remove(&Model::Tmpl(Tmpl {
                id: "used".to_owned(),
                ..Tmpl::default()
            }))
            .unwrap_err();
        assert_eq!(err.code, 409);
        assert!(err.messages.iter().any(|m| m.contains("bootenvs:refs-template")));
    });
}

#[test]
fn only_unknown_delete_deregisters_and_prunes_tree() {
    let (_root, dt) = test_dt();
    let mut env = BootEnv::default();
    env.name = "discovery".to_owned();
    env.os.name = "sledgehammer".to_owned();
    env.only_unknown = true;
    env.templates = vec![TemplateInfo {
        name: "ipxe".to_owned(),
        path: "/discovery.ipxe".to_owned(),
        contents: "boot".to_owned(),
        ..TemplateInfo::default()
    }];

    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        tx.create(Model::BootEnv(env)).unwrap();
    });
    assert!(dt.fs().rendered_paths().contains(&"/discovery.ipxe".to_owned()));

    rt.do_with(|tx| {
        let mut skel = BootEnv::default();
        skel.name = "discovery".to_owned();
        tx.remove(&Model::BootEnv(skel)).unwrap();
    });
    assert!(dt.fs().rendered_paths().is_empty());
}

/// Tiny single-purpose HTTP server so lookaside fetches stay local.
struct MirrorServer {
    addr: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MirrorServer {
    fn start(body: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                if let Some(path) = request_line.split_whitespace().nth(1) {
                    seen.lock().unwrap().push(path.to_owned());
                }
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                        break;
                    }
                }
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(body);
                let _ = stream.flush();
            }
        });
        MirrorServer { addr, requests }
    }
}

#[test]
fn install_repo_stands_in_for_local_files() {
    let (_root, dt) = test_dt();
    let mirror = MirrorServer::start(b"LINUX-FROM-MIRROR");

    let repo = Repo {
        tag: "ubuntu-mirror".to_owned(),
        os: vec!["ubuntu".to_owned()],
        url: format!("{}/repo", mirror.addr),
        boot_loc: format!("{}/boot", mirror.addr),
        arch: "amd64".to_owned(),
        install_source: true,
        ..Repo::default()
    };

    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        let mut global = Profile::default();
        global.name = "global".to_owned();
        global.params.insert(
            "package-repositories".to_owned(),
            serde_json::to_value(vec![&repo]).unwrap(),
        );
        tx.create(Model::Profile(global)).unwrap();

        // No kernel or initrd on disk, but the repo is an install
        // source, so the env is bootable and available.
        let saved = tx.create(Model::BootEnv(ubuntu_install())).unwrap();
        assert!(saved.validation().available, "{:?}", saved.validation().errors);

        let Model::BootEnv(env) = &saved else { unreachable!() };
        can_arch_boot(tx, env, "amd64").unwrap();
        can_arch_boot(tx, env, "x86_64").unwrap();
        assert!(can_arch_boot(tx, env, "arm64").is_err());
    });

    assert!(dt.fs().has_dynamic_tree("/ubuntu/install"));

    // Kernel requests rewrite onto the repo's boot location.
    let body = read_stream(dt.fs(), "/ubuntu/install/linux");
    assert_eq!(body, b"LINUX-FROM-MIRROR");
    // Other paths proxy under the repo URL with the tree prefix
    // stripped.
    let _ = read_stream(dt.fs(), "/ubuntu/install/dists/Release");
    {
        let requests = mirror.requests.lock().unwrap();
        assert_eq!(requests[0], "/boot/linux");
        assert_eq!(requests[1], "/repo/dists/Release");
    }

    // Deleting the last bootenv for the OS prunes its dynamic tree.
    rt.do_with(|tx| {
        let mut skel = BootEnv::default();
        skel.name = "ubuntu-install".to_owned();
        tx.remove(&Model::BootEnv(skel)).unwrap();
    });
    assert!(!dt.fs().has_dynamic_tree("/ubuntu/install"));
    assert!(dt.fs().open("/ubuntu/install/linux").is_err());
}

#[test]
fn iso_explosion_invokes_external_helper_once_per_save() {
    let (root, dt) = test_dt();
    std::fs::create_dir_all(root.path().join("isos")).unwrap();
    std::fs::write(root.path().join("isos/mini.iso"), b"fake-iso").unwrap();

    let script = root.path().join("explode_iso.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nmkdir -p \"$4\"\necho \"$1\" > \"$4/.exploded\"\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut env = ubuntu_install();
    env.templates.clear();
    env.os.iso_file = "mini.iso".to_owned();

    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        tx.create(Model::BootEnv(env)).unwrap();
    });

    // The helper ran synchronously after the locks released.
    let marker = root.path().join("ubuntu/install/.exploded");
    let content = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(content.trim(), "ubuntu");
}

#[test]
fn iso_explosion_skipped_when_canary_matches() {
    let (root, dt) = test_dt();
    std::fs::create_dir_all(root.path().join("isos")).unwrap();
    std::fs::write(root.path().join("isos/mini.iso"), b"fake-iso").unwrap();
    // No helper script on disk: if explosion were attempted it would
    // log a failure; the canary short-circuits before that.
    let tree = root.path().join("ubuntu/install");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join(".ubuntu.rebar_canary"), "match-me\n").unwrap();

    let mut env = ubuntu_install();
    env.templates.clear();
    env.os.iso_file = "mini.iso".to_owned();
    env.os.iso_sha256 = "match-me".to_owned();

    let mut rt = dt.request(locks_for("bootenvs", "create"));
    rt.do_with(|tx| {
        tx.create(Model::BootEnv(env)).unwrap();
    });
    // Nothing exploded, nothing failed: the canary is still the only
    // content in the tree.
    let entries: Vec<_> = std::fs::read_dir(&tree).unwrap().collect();
    assert_eq!(entries.len(), 1);
}
