use allot_core::config::Config;
use allot_plugins::{BackendOptions, DiscoveryPlugin, PluginError, PluginRegistry};

fn config(discovery_plugin: &str, quota_plugin: &str) -> Config {
    let yaml = format!(
        r#"
database:
  url: "postgres://allot@localhost/allot"
clusters:
  west:
    discovery:
      plugin: {discovery_plugin}
      static_domains:
        - uuid: uuid-for-germany
          name: germany
          projects:
            - {{ uuid: uuid-for-berlin, name: berlin }}
    services:
      - type: shared
        plugin: {quota_plugin}
      - type: unshared
        plugin: {quota_plugin}
    capacitors:
      - id: unittest
        plugin: unittest
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn builds_from_config_and_lists_domains() {
    let config = config("static", "unittest");
    let cluster = config.cluster("west").unwrap();
    let registry = PluginRegistry::from_config(cluster, BackendOptions::default()).unwrap();

    let domains = registry.discovery().list_domains().await.unwrap();
    assert_eq!(domains.len(), 1);
    assert_eq!(domains[0].name, "germany");

    let projects = registry
        .discovery()
        .list_projects(&domains[0])
        .await
        .unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].uuid, "uuid-for-berlin");

    assert!(registry.quota_plugin("shared").is_some());
    assert!(registry.quota_plugin("network").is_none());
    assert_eq!(registry.quota_plugins().count(), 2);
    assert_eq!(registry.capacity_plugins().count(), 1);

    let advertised = registry.advertised_resources("shared");
    assert!(advertised.contains("capacity"));
    assert!(advertised.contains("things"));
    assert!(registry.advertised_resources("network").is_empty());
}

#[test]
fn unknown_plugin_names_fail_startup() {
    let cfg = config("static", "nonexistent");
    let cluster = cfg.cluster("west").unwrap();
    let err = PluginRegistry::from_config(cluster, BackendOptions::default()).unwrap_err();
    assert!(matches!(err, PluginError::UnknownPlugin { kind: "quota", .. }));

    let cfg = config("nonexistent", "unittest");
    let cluster = cfg.cluster("west").unwrap();
    let err = PluginRegistry::from_config(cluster, BackendOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        PluginError::UnknownPlugin {
            kind: "discovery",
            ..
        }
    ));
}
