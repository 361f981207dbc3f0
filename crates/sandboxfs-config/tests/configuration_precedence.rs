//! Behaviour tests for configuration layering.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use sandboxfs_config::{Config, default_log_filter, default_log_format};

struct Harness {
    temp_dir: TempDir,
    cli_args: RefCell<Vec<OsString>>,
    env_overrides: RefCell<Vec<(String, Option<OsString>)>>,
    loaded: RefCell<Option<Config>>,
    error: RefCell<Option<String>>,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("failed to create temporary directory: {error}"),
        };
        Self {
            temp_dir,
            cli_args: RefCell::new(vec![OsString::from("sandboxd")]),
            env_overrides: RefCell::new(Vec::new()),
            loaded: RefCell::new(None),
            error: RefCell::new(None),
        }
    }

    fn write_config(&self, contents: &str) {
        let path = self.temp_dir.path().join("sandboxd.toml");
        if let Err(error) = fs::write(&path, contents) {
            panic!("failed to write configuration: {error}");
        }

        let mut args = self.cli_args.borrow_mut();
        args.push(OsString::from("--config-path"));
        args.push(path.into_os_string());
    }

    fn set_env(&self, key: &str, value: &str) {
        let previous = std::env::var_os(key);
        // Restored in `Drop` so the wider process environment is unchanged.
        unsafe { std::env::set_var(key, value) };
        self.env_overrides
            .borrow_mut()
            .push((key.to_owned(), previous));
    }

    fn push_cli_arg(&self, arg: impl Into<OsString>) {
        self.cli_args.borrow_mut().push(arg.into());
    }

    fn load(&self) {
        if self.loaded.borrow().is_some() || self.error.borrow().is_some() {
            return;
        }

        let args = self.cli_args.borrow().clone();
        match Config::load_from_iter(args) {
            Ok(config) => *self.loaded.borrow_mut() = Some(config),
            Err(error) => *self.error.borrow_mut() = Some(error.to_string()),
        }
    }

    fn loaded_config(&self) -> Config {
        self.load();
        if let Some(error) = self.error.borrow().as_ref() {
            panic!("configuration failed to load: {error}");
        }
        match self.loaded.borrow().as_ref() {
            Some(config) => config.clone(),
            None => panic!("configuration was not loaded"),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let mut overrides = self.env_overrides.borrow_mut();
        while let Some((key, value)) = overrides.pop() {
            if let Some(os_value) = value {
                unsafe { std::env::set_var(&key, os_value) };
            } else {
                unsafe { std::env::remove_var(&key) };
            }
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[given("a configuration file setting the sandboxfs path to \"{path}\"")]
fn given_configuration_file(harness: &Harness, path: String) {
    harness.write_config(&format!("sandboxfs_path = \"{path}\"\n"));
}

#[given("the environment overrides the sandbox base directory to \"{path}\"")]
fn given_environment_override(harness: &Harness, path: String) {
    harness.set_env("SANDBOXD_SANDBOX_BASE_DIR", &path);
}

#[given("the CLI enables the sandbox filesystem")]
fn given_cli_enables_sandbox(harness: &Harness) {
    harness.push_cli_arg("--use-sandboxfs");
}

#[given("the CLI enables sandbox debugging")]
fn given_cli_enables_debug(harness: &Harness) {
    harness.push_cli_arg("--sandbox-debug");
}

#[when("the CLI sets the sandboxfs path to \"{path}\"")]
fn when_cli_override(harness: &Harness, path: String) {
    harness.push_cli_arg("--sandboxfs-path");
    harness.push_cli_arg(OsString::from(&path));
}

#[when("the configuration loads without overrides")]
fn when_load_without_overrides(harness: &Harness) {
    harness.load();
}

#[then("loading the configuration applies the built-in defaults")]
fn then_defaults_applied(harness: &Harness) {
    let config = harness.loaded_config();

    assert!(!config.use_sandboxfs, "sandbox should default to disabled");
    assert!(!config.sandbox_debug, "debug should default to disabled");
    assert_eq!(config.program_name(), "sandboxfs");
    assert_eq!(config.log_filter(), default_log_filter());
    assert_eq!(config.log_format(), default_log_format());
    assert_eq!(config.terminate_timeout_ms, 5_000);
}

#[then("loading the configuration enables the sandbox with debug retention")]
fn then_debug_enabled(harness: &Harness) {
    let options = harness.loaded_config().build_options();

    assert!(options.enabled(), "sandbox should be enabled");
    assert!(options.debug(), "debug retention should be enabled");
}

#[then("loading the configuration resolves the sandboxfs path to \"{path}\"")]
fn then_resolved_path(harness: &Harness, path: String) {
    let config = harness.loaded_config();
    assert_eq!(config.sandboxfs_path, Some(Utf8PathBuf::from(path)));
}

#[then("the sandbox base directory is \"{path}\"")]
fn then_base_dir(harness: &Harness, path: String) {
    let config = harness.loaded_config();
    assert_eq!(config.sandbox_base_dir, Some(Utf8PathBuf::from(path)));
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Built-in defaults leave the sandbox disabled"
)]
fn defaults_leave_sandbox_disabled(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Command-line flags enable debug retention"
)]
fn cli_flags_enable_debug(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Command-line flags override the configuration file"
)]
fn cli_overrides_file(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Environment variables layer over the configuration file"
)]
fn environment_overrides_file(#[from(harness)] harness: Harness) {
    let _ = harness;
}
