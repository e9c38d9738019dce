// CLI dispatch against a throwaway container

use std::process::Command;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_widget-entitlements"))
}

#[test]
fn test_help_and_unknown_commands_touch_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("entitlements.db");

    let help = cli()
        .arg("help")
        .env("ENTITLEMENTS_DB", &db_path)
        .env_remove("ENTITLEMENTS_CONFIG")
        .output()
        .unwrap();
    assert!(help.status.success());
    assert!(String::from_utf8_lossy(&help.stdout).contains("Usage"));

    let unknown = cli()
        .arg("frobnicate")
        .env("ENTITLEMENTS_DB", &db_path)
        .env_remove("ENTITLEMENTS_CONFIG")
        .output()
        .unwrap();
    assert_eq!(unknown.status.code(), Some(2));

    assert!(!db_path.exists(), "no container for help / unknown commands");
}

#[test]
fn test_restore_sees_purchase_from_earlier_run() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("entitlements.db");

    let run = |args: &[&str]| {
        let output = cli()
            .args(args)
            .env("ENTITLEMENTS_DB", &db_path)
            .env_remove("ENTITLEMENTS_CONFIG")
            .output()
            .unwrap();
        assert!(output.status.success(), "{:?} failed: {:?}", args, output);
        String::from_utf8_lossy(&output.stdout).into_owned()
    };

    run(&["purchase", "widget_premium_clock_1"]);
    run(&["clear"]);
    let restored = run(&["restore"]);

    assert!(restored.contains("com.app.widget.premium_clock_1"));
    assert!(run(&["check", "widget_premium_clock_1"]).contains("Unlocked"));

    println!("✅ CLI restore across runs PASSED");
}
