//! Public surface smoke test.

use subwarden::{CommandTemplate, RuleKey, RuleOp, SubwardenConfig};

#[test]
fn crate_compiles() {
    let _ = std::any::type_name::<subwarden::Subwarden>();
    let _ = std::any::type_name::<subwarden::SubwardenError>();
}

#[test]
fn default_config_needs_a_host() {
    let mut config = SubwardenConfig::default();
    assert!(config.validate().is_err());
    config.remote.host = "gw.example.net".to_string();
    assert!(config.validate().is_ok());
}

#[test]
fn block_command_shape() {
    let key = RuleKey::parse("192.0.2.10", "acct-42").unwrap();
    let command = CommandTemplate::default().command(RuleOp::Add, &key);
    assert_eq!(
        command.to_shell_line(),
        "iptables -I FORWARD -s 192.0.2.10 -m comment --comment subwarden-acct-42 -j DROP"
    );
}
