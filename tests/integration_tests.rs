#[cfg(test)]
mod config_tests {
    use plughost::config::Config;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.plugins.directory, PathBuf::from("plugins"));
        assert!(config.plugins.use_isolation);
        assert!(config.plugins.auto_load_on_startup);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_load() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");

        let yaml = r#"
plugins:
  directory: /srv/plugins
  auto_load_on_startup: false
  include: [audit, metrics]
  shared_prefixes: ["host::"]
logging:
  level: debug
"#;
        std::fs::write(&config_path, yaml).unwrap();

        let loaded = Config::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.plugins.directory, PathBuf::from("/srv/plugins"));
        assert!(!loaded.plugins.auto_load_on_startup);
        assert!(loaded.plugins.use_isolation);
        assert_eq!(loaded.plugins.include, vec!["audit", "metrics"]);
        assert_eq!(loaded.plugins.shared_prefixes, vec!["host::"]);
        assert_eq!(loaded.logging.level, "debug");
    }

    #[test]
    fn test_config_save_and_reload() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("nested").join("config.yaml");

        let mut config = Config::default();
        config.plugins.exclude = vec!["legacy".to_string()];
        config.plugins.search_pattern = Some("*.so".to_string());
        config.save_to_file(&config_path).unwrap();

        let reloaded = Config::load_from_file(&config_path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "plugins: 42").unwrap();

        let err = Config::load_from_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Config::load_from_file(dir.path().join("absent.yaml")).is_err());
    }
}

#[cfg(test)]
mod loader_tests {
    use plughost::plugins::{PluginLoader, PluginRegistrar, SharedPrefixes, StaticBackend};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn no_plugins(_r: &mut PluginRegistrar) {}

    #[test]
    fn test_discovery_recurses_and_filters() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("vendor").join("extra");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("top.plugin"), b"").unwrap();
        std::fs::write(nested.join("deep.plugin"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let loader = PluginLoader::with_backend(Arc::new(StaticBackend::new()));
        let found = loader.discover(dir.path(), "*.plugin");

        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|p| p.ends_with("top.plugin")));
        assert!(found.iter().any(|p| p.ends_with("vendor/extra/deep.plugin")));
    }

    #[test]
    fn test_discovery_of_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::with_backend(Arc::new(StaticBackend::new()));
        assert!(loader.discover(&dir.path().join("absent"), "*").is_empty());
    }

    #[test]
    fn test_module_without_plugins_loads_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hollow.plugin");
        std::fs::write(&path, b"").unwrap();

        let backend = StaticBackend::new().with_module("hollow", no_plugins);
        let loader = PluginLoader::with_backend(Arc::new(backend));

        assert!(loader.load(&path, true).is_none());
        assert!(!loader.is_isolated(&path));
    }

    #[test]
    fn test_unload_of_unknown_path_is_noop() {
        let dir = tempdir().unwrap();
        let loader = PluginLoader::with_backend(Arc::new(StaticBackend::new()));
        loader.unload(&dir.path().join("never-loaded.plugin"));
        assert!(loader.isolated_paths().is_empty());
    }

    #[test]
    fn test_shared_prefix_rule() {
        let shared = SharedPrefixes::new(["plughost::", "std::"]);
        assert!(shared.is_shared("plughost::plugins::api"));
        assert!(shared.is_shared("STD::collections"));
        assert!(shared.is_shared("std"));
        assert!(!shared.is_shared("stdx::io"));
        assert!(!shared.is_shared("audit_plugin"));
    }
}
