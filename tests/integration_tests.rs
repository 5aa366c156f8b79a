//! Integration tests for the storyforge CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a storyforge Command
fn storyforge() -> Command {
    cargo_bin_cmd!("storyforge")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn write_config(dir: &Path, content: &str) {
    let storyforge_dir = dir.join(".storyforge");
    fs::create_dir_all(&storyforge_dir).unwrap();
    fs::write(storyforge_dir.join("storyforge.toml"), content).unwrap();
}

fn write_story(dir: &Path, key: &str) {
    let stories = dir.join(".storyforge/stories");
    fs::create_dir_all(&stories).unwrap();
    fs::write(
        stories.join(format!("{}.md", key)),
        format!("# {}\n\nAs a user I want to log in.\n", key),
    )
    .unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        storyforge()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("story"))
            .stdout(predicate::str::contains("collab"))
            .stdout(predicate::str::contains("checkpoint"))
            .stdout(predicate::str::contains("validate"))
            .stdout(predicate::str::contains("route"));
    }

    #[test]
    fn test_version() {
        storyforge().arg("--version").assert().success();
    }

    #[test]
    fn test_collab_strategies_are_exclusive() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["collab", "1-1-login", "--swarm", "--pair"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot be used with"));
    }
}

// =============================================================================
// Routing
// =============================================================================

mod route {
    use super::*;

    #[test]
    fn test_route_only_prints_decision() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["route", "--route-only", "add", "a", "login", "form"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Strategy:"))
            .stdout(predicate::str::contains("Complexity:"));

        assert!(!dir.path().join(".storyforge/stories").exists());
    }

    #[test]
    fn test_route_requires_task() {
        storyforge().args(["route", "--route-only"]).assert().failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_validate_defaults() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_validate_reports_warnings() {
        let dir = create_temp_project();
        write_config(dir.path(), "[budget.caps]\nreview = 0.0\n");
        storyforge()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("warnings"))
            .stdout(predicate::str::contains("review"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let dir = create_temp_project();
        write_config(dir.path(), "[budget]\nwarning_percent = 95.0\ncritical_percent = 90.0\n");
        storyforge()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn test_bad_env_override_is_an_error() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .env("STORYFORGE_BUDGET_PLANNING", "lots")
            .args(["config", "show"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("STORYFORGE_BUDGET_PLANNING"));
    }

    #[test]
    fn test_show_includes_env_overrides() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .env("STORYFORGE_AGENT_CMD", "my-agent")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[budget"))
            .stdout(predicate::str::contains("agent command: my-agent"));
    }
}

// =============================================================================
// Validation
// =============================================================================

mod validate {
    use super::*;

    #[test]
    fn test_missing_story_file_fails_preflight() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["validate", "1-1-login", "--tier", "1"])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("story-file"));
    }

    #[test]
    fn test_preflight_passes_with_story_file() {
        let dir = create_temp_project();
        write_story(dir.path(), "1-1-login");
        storyforge()
            .current_dir(dir.path())
            .args(["validate", "1-1-login", "--tier", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("All gates passed"));
    }

    #[test]
    fn test_unknown_tier_is_an_error() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["validate", "1-1-login", "--tier", "7"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Invalid tier"));
    }
}

// =============================================================================
// Checkpoints and status
// =============================================================================

mod checkpoints {
    use super::*;

    #[test]
    fn test_list_without_checkpoints() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["checkpoint", "list", "1-1-login"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No checkpoints for story 1-1-login"));
    }

    #[test]
    fn test_restore_without_checkpoints_fails() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["checkpoint", "restore", "1-1-login"])
            .assert()
            .failure();
    }

    #[test]
    fn test_save_then_list() {
        let dir = create_temp_project();
        write_story(dir.path(), "1-1-login");
        storyforge()
            .current_dir(dir.path())
            .args(["checkpoint", "save", "1-1-login"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1-1-login@1"));

        storyforge()
            .current_dir(dir.path())
            .args(["checkpoint", "list", "1-1-login"])
            .assert()
            .success()
            .stdout(predicate::str::contains("manual"));
    }

    #[test]
    fn test_key_with_path_is_rejected() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .args(["checkpoint", "save", "../x"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("story key"));

        storyforge()
            .current_dir(dir.path())
            .args(["checkpoint", "list", "../x"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("story key"));

        assert!(!dir.path().join(".storyforge/x").exists());
    }

    #[test]
    fn test_status_on_empty_project() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No stories have started yet"))
            .stdout(predicate::str::contains("Rolling aggregate"));
    }
}

// =============================================================================
// Story runs
// =============================================================================

mod story {
    use super::*;

    #[test]
    fn test_unavailable_agent_fails_story() {
        let dir = create_temp_project();
        write_story(dir.path(), "1-1-login");
        storyforge()
            .current_dir(dir.path())
            .env("STORYFORGE_AGENT_CMD", "storyforge-test-no-such-agent")
            .args(["story", "1-1-login"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("failed"));

        let sprint = fs::read_to_string(dir.path().join(".storyforge/sprint-status.yaml")).unwrap();
        assert!(sprint.contains("1-1-login"));
        assert!(sprint.contains("failed"));
    }

    #[test]
    fn test_missing_story_file_blocks_before_any_agent_runs() {
        let dir = create_temp_project();
        storyforge()
            .current_dir(dir.path())
            .env("STORYFORGE_AGENT_CMD", "storyforge-test-no-such-agent")
            .args(["story", "9-9-missing"])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("story-file"));
    }
}
