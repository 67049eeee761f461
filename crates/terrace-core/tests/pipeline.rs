use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use terrace_core::app::{AppDefinition, Values};
use terrace_core::env::EnvConfig;
use terrace_core::graph;
use terrace_core::manager::AppManager;
use terrace_core::namespace::NoopNamespaceCreator;
use terrace_core::ports::{NoopPortAllocator, PortAllocator, PortForward};
use terrace_core::store::{
    write_yaml, DoOptions, LocalTransport, PullOutcome, RepoRead, Signature, Store, Transport,
};
use terrace_core::tasks::Task;
use terrace_core::{Result, TerraceError};

const PIHOLE: &str = r#"
name: pihole
namespaces: [app-pihole]
readme: "Pi-hole running at {{ values.Subdomain }}.{{ global.domain }}"
config: |
  subdomain: {{ values.Subdomain }}
resources:
  deployment.yaml: |
    apiVersion: helm.toolkit.fluxcd.io/v2beta1
    kind: HelmRelease
    metadata:
      name: pihole
      namespace: {{ release.namespace }}
    spec:
      values:
        host: {{ values.Subdomain }}.{{ global.domain }}
  ingress.yaml: |
    apiVersion: networking.k8s.io/v1
    kind: Ingress
    metadata:
      name: pihole-{{ values.Subdomain }}
      namespace: {{ release.namespace }}
data:
  notes.md: "{{ release.appInstanceId }} lives in {{ release.appDir }}"
"#;

struct Env {
    _dir: TempDir,
    transport: Arc<LocalTransport>,
    manager: AppManager,
}

async fn env_with(ports: Arc<dyn PortAllocator>) -> Env {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(LocalTransport::new("ssh://repo.local/config"));
    let store = Arc::new(Store::new(dir.path(), transport.clone()).unwrap());
    store
        .transact(
            |fs| {
                let cfg = EnvConfig {
                    id: "dev".into(),
                    infra_name: "lab".into(),
                    domain: "example.com".into(),
                    ..Default::default()
                };
                write_yaml(fs, "config.yaml", &cfg)?;
                Ok("initialize".into())
            },
            DoOptions::default(),
        )
        .await
        .unwrap();
    let manager = AppManager::new(store, Arc::new(NoopNamespaceCreator), ports, "apps").unwrap();
    Env {
        _dir: dir,
        transport,
        manager,
    }
}

async fn env() -> Env {
    env_with(Arc::new(NoopPortAllocator)).await
}

fn subdomain(s: &str) -> Values {
    let mut v = Values::new();
    v.insert("Subdomain".into(), s.into());
    v
}

fn pihole() -> AppDefinition {
    AppDefinition::from_yaml(PIHOLE).unwrap()
}

// ---------------------------------------------------------------------------
// install / update / remove
// ---------------------------------------------------------------------------

#[tokio::test]
async fn install_pihole_writes_expected_layout() {
    let env = env().await;
    let res = env
        .manager
        .install_instance(&pihole(), "pihole-ab3", "ns1", &subdomain("dns"))
        .await
        .unwrap();
    assert_eq!(res.resources.len(), 2);
    assert!(res.resources.iter().all(|r| r.namespace == "ns1"));

    let store = env.manager.store();
    for path in [
        "apps/pihole-ab3/config.json",
        "apps/pihole-ab3/config.yaml",
        "apps/pihole-ab3/notes.md",
        "apps/pihole-ab3/resources/deployment.yaml",
        "apps/pihole-ab3/resources/ingress.yaml",
        "apps/pihole-ab3/resources/kustomization.yaml",
    ] {
        assert!(store.exists(path).unwrap(), "missing {path}");
    }
    let root = graph::read_manifest(store.as_ref(), "").unwrap();
    assert!(root.contains("apps"), "{root:?}");
    let apps = graph::read_manifest(store.as_ref(), "apps").unwrap();
    assert_eq!(apps.resources, vec!["pihole-ab3"]);
    let instance = graph::read_manifest(store.as_ref(), "apps/pihole-ab3").unwrap();
    assert_eq!(instance.resources, vec!["resources"]);
    let resources = graph::read_manifest(store.as_ref(), "apps/pihole-ab3/resources").unwrap();
    assert_eq!(resources.resources, vec!["deployment.yaml", "ingress.yaml"]);

    let notes = String::from_utf8(store.read("apps/pihole-ab3/notes.md").unwrap()).unwrap();
    assert_eq!(notes, "pihole-ab3 lives in apps/pihole-ab3");
    assert_eq!(env.transport.commits().last().unwrap(), "install: pihole");
}

#[tokio::test]
async fn update_replaces_values_and_resources() {
    let env = env().await;
    let def = pihole();
    env.manager
        .install_instance(&def, "pihole-ab3", "ns1", &subdomain("dns"))
        .await
        .unwrap();

    env.manager
        .update(&def, "pihole-ab3", &subdomain("ads"), DoOptions::default())
        .await
        .unwrap();

    let found = env.manager.find_instance("pihole-ab3").unwrap();
    assert_eq!(found.input, subdomain("ads"));
    assert_eq!(found.release.namespace, "ns1");
    assert_eq!(found.config["subdomain"], "ads");

    let store = env.manager.store();
    let deployment =
        String::from_utf8(store.read("apps/pihole-ab3/resources/deployment.yaml").unwrap()).unwrap();
    assert!(deployment.contains("host: ads.example.com"), "{deployment}");
    assert!(!deployment.contains("dns.example.com"), "{deployment}");
}

#[tokio::test]
async fn update_drops_resources_no_longer_rendered() {
    let env = env().await;
    let mut def = pihole();
    env.manager
        .install_instance(&def, "pihole-ab3", "ns1", &subdomain("dns"))
        .await
        .unwrap();
    def.resources.remove("ingress.yaml");
    env.manager
        .update(&def, "pihole-ab3", &subdomain("dns"), DoOptions::default())
        .await
        .unwrap();

    let store = env.manager.store();
    assert!(!store.exists("apps/pihole-ab3/resources/ingress.yaml").unwrap());
    let resources = graph::read_manifest(store.as_ref(), "apps/pihole-ab3/resources").unwrap();
    assert_eq!(resources.resources, vec!["deployment.yaml"]);
}

#[tokio::test]
async fn update_without_commit_leaves_no_commit() {
    let env = env().await;
    let def = pihole();
    env.manager
        .install_instance(&def, "pihole-ab3", "ns1", &subdomain("dns"))
        .await
        .unwrap();
    let before = env.transport.commits().len();
    env.manager
        .update(&def, "pihole-ab3", &subdomain("ads"), DoOptions::no_commit())
        .await
        .unwrap();
    assert_eq!(env.transport.commits().len(), before);
    assert_eq!(
        env.manager.find_instance("pihole-ab3").unwrap().input,
        subdomain("ads")
    );
}

#[tokio::test]
async fn reserved_data_name_leaves_nothing_behind() {
    let env = env().await;
    let mut def = pihole();
    def.data.insert("config.json".into(), "{}".into());
    let commits = env.transport.commits().len();

    let err = env
        .manager
        .install_instance(&def, "pihole-ab3", "ns1", &subdomain("dns"))
        .await
        .unwrap_err();

    assert!(matches!(err, TerraceError::NameConflict(ref n) if n == "config.json"), "{err}");
    assert!(!env.manager.store().exists("apps/pihole-ab3").unwrap());
    assert_eq!(env.transport.commits().len(), commits);
}

#[tokio::test]
async fn template_error_happens_before_any_write() {
    let env = env().await;
    let err = env
        .manager
        .install_instance(&pihole(), "pihole-ab3", "ns1", &Values::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TerraceError::Template { .. }), "{err}");
    assert!(!env.manager.store().exists("apps/pihole-ab3").unwrap());
}

#[tokio::test]
async fn remove_deletes_instance_and_unlists_it() {
    let env = env().await;
    env.manager
        .install_instance(&pihole(), "pihole-ab3", "ns1", &subdomain("dns"))
        .await
        .unwrap();
    env.manager.remove("pihole-ab3").await.unwrap();

    let store = env.manager.store();
    assert!(!store.exists("apps/pihole-ab3").unwrap());
    assert!(!graph::read_manifest(store.as_ref(), "apps")
        .unwrap()
        .contains("pihole-ab3"));
    assert!(env.manager.find_instance("pihole-ab3").unwrap_err().is_not_found());
    assert_eq!(env.transport.commits().last().unwrap(), "uninstall: pihole-ab3");
}

// ---------------------------------------------------------------------------
// ports
// ---------------------------------------------------------------------------

struct RejectingAllocator;

#[async_trait]
impl PortAllocator for RejectingAllocator {
    async fn allocate(&self, port: &PortForward) -> Result<()> {
        Err(TerraceError::Allocation {
            port: port.source_port,
            reason: "status code: 500".into(),
        })
    }
}

#[tokio::test]
async fn failed_port_allocation_keeps_committed_instance() {
    let env = env_with(Arc::new(RejectingAllocator)).await;
    let mut def = pihole();
    def.ports = Some(
        "- allocator: http://allocator.invalid/api/allocate\n  protocol: TCP\n  sourcePort: 53\n  targetService: ns1/pihole\n  targetPort: 53\n"
            .into(),
    );
    let err = env
        .manager
        .install_instance(&def, "pihole-ab3", "ns1", &subdomain("dns"))
        .await
        .unwrap_err();
    assert!(matches!(err, TerraceError::Allocation { port: 53, .. }), "{err}");
    assert!(env.manager.find_instance("pihole-ab3").is_ok());
    assert_eq!(env.transport.commits().last().unwrap(), "install: pihole");
}

// ---------------------------------------------------------------------------
// concurrency
// ---------------------------------------------------------------------------

/// Records how many commits are in flight at once.
#[derive(Default)]
struct OverlapTransport {
    active: AtomicUsize,
    max_active: AtomicUsize,
    commits: AtomicUsize,
}

#[async_trait]
impl Transport for OverlapTransport {
    fn full_address(&self) -> String {
        "ssh://repo.local/config".into()
    }

    async fn pull(&self, _worktree: &Path) -> Result<PullOutcome> {
        Ok(PullOutcome::UpToDate)
    }

    async fn commit_and_push(&self, _worktree: &Path, _message: &str, _author: &Signature) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_installs_and_removes_never_overlap() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(OverlapTransport::default());
    let store = Arc::new(Store::new(dir.path(), transport.clone()).unwrap());
    store
        .transact(
            |fs| {
                let cfg = EnvConfig {
                    id: "dev".into(),
                    domain: "example.com".into(),
                    ..Default::default()
                };
                write_yaml(fs, "config.yaml", &cfg)?;
                Ok("initialize".into())
            },
            DoOptions::default(),
        )
        .await
        .unwrap();
    let manager = Arc::new(
        AppManager::new(
            store,
            Arc::new(NoopNamespaceCreator),
            Arc::new(NoopPortAllocator),
            "apps",
        )
        .unwrap(),
    );
    let def = Arc::new(pihole());

    for i in 0..4 {
        manager
            .install_instance(&def, &format!("old-{i}"), "ns1", &subdomain("old"))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        let def = def.clone();
        handles.push(tokio::spawn(async move {
            manager
                .install_instance(&def, &format!("pihole-{i}"), "ns1", &subdomain(&format!("d{i}")))
                .await
                .map(|_| ())
        }));
    }
    for i in 0..4 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.remove(&format!("old-{i}")).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(transport.commits.load(Ordering::SeqCst), 1 + 4 + 8 + 4);
    let all = manager.find_all_instances().await.unwrap();
    assert_eq!(all.len(), 8);
    assert!(all.iter().all(|i| i.id.starts_with("pihole-")));
    assert_eq!(manager.find_all_app_instances("pihole").unwrap().len(), 8);
}

// ---------------------------------------------------------------------------
// tasks driving the pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_install_then_remove_task() {
    let env = env().await;
    let manager = Arc::new(env.manager);
    let install = {
        let manager = manager.clone();
        Task::leaf("install", move || async move {
            manager
                .install_instance(&pihole(), "pihole-ab3", "ns1", &subdomain("dns"))
                .await
                .map(|_| ())
        })
    };
    let settle = Task::leaf("settle", || async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(())
    });
    let remove = {
        let manager = manager.clone();
        Task::leaf("remove", move || async move { manager.remove("pihole-ab3").await })
    };
    Task::sequential("lifecycle", vec![install, settle, remove])
        .execute()
        .await
        .unwrap();
    assert!(manager.find_all_instances().await.unwrap().is_empty());
    assert_eq!(
        env.transport.commits()[1..],
        ["install: pihole".to_string(), "uninstall: pihole-ab3".to_string()]
    );
}
