use anyhow::Result;
use std::path::PathBuf;

use QuiverCGI::config::{ConfigTable, ServerConfig};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("qcgi-{}-{}-{}", prefix, pid, t))
}

#[test]
fn first_occurrence_wins_across_sections() -> Result<()> {
    let t = ConfigTable::parse_str("[a]\nx = \"1\"\n[b]\nx = 2\n")?;
    assert_eq!(t.get("x"), Some("1"));
    assert_eq!(t.section_of("x"), Some("a"));
    assert_eq!(t.len(), 1);
    Ok(())
}

#[test]
fn quoting_and_comments() -> Result<()> {
    let text = r#"
# leading comment
; another comment
[server]
listen = "unix:/tmp/q.sock"   # trailing comment after quotes
port = 9001 ; inline
note = 'a;b#c'
empty =
"#;
    let t = ConfigTable::parse_str(text)?;
    assert_eq!(t.get("listen"), Some("unix:/tmp/q.sock"));
    assert_eq!(t.get_parsed::<u16>("port")?, Some(9001));
    assert_eq!(t.get("note"), Some("a;b#c"));
    assert_eq!(t.get("empty"), Some(""));
    assert_eq!(t.get("missing"), None);
    assert!(t.get_parsed::<u16>("note").is_err());

    let keys: Vec<String> = t.entries().into_iter().map(|(k, _, _)| k).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    Ok(())
}

#[test]
fn malformed_lines_are_rejected() {
    assert!(ConfigTable::parse_str("[open\n").is_err());
    assert!(ConfigTable::parse_str("just words\n").is_err());
    assert!(ConfigTable::parse_str(" = 1\n").is_err());
    assert!(ConfigTable::parse_str("x = \"unterminated\n").is_err());
}

#[test]
fn merge_into_server_config() -> Result<()> {
    let root = unique_root("cfg-merge");
    std::fs::create_dir_all(&root)?;
    let path = root.join("quivercgi.conf");
    std::fs::write(
        &path,
        "[listen]\nlisten = 0.0.0.0\nport = 9100\n\n[workers]\nworkers = 8\nstream_buffer = 4096\n\
         [sessions]\nsession_dir = /var/tmp/qs\nsession_ttl = 600\nsession_sweep = 0\n\
         [acl]\nallow = 127.0.0.1, ::1\n",
    )?;
    let table = ConfigTable::load(&path)?;
    let cfg = ServerConfig::default().merge_table(&table)?;

    assert_eq!(cfg.listen, "0.0.0.0");
    assert_eq!(cfg.port, 9100);
    assert_eq!(cfg.workers, 8);
    assert_eq!(cfg.stream_buffer, 4096);
    assert_eq!(cfg.session_dir, PathBuf::from("/var/tmp/qs"));
    assert_eq!(cfg.session_ttl_secs, 600);
    assert_eq!(cfg.session_sweep_secs, 0);
    assert_eq!(cfg.allow, vec!["127.0.0.1".to_string(), "::1".to_string()]);
    // незаданные ключи остаются по умолчанию
    assert_eq!(cfg.handlers_dir, None);
    cfg.validate()?;

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn invalid_values_fail_validation() -> Result<()> {
    let mut t = ConfigTable::new();
    t.set("", "workers", "0")?;
    let cfg = ServerConfig::default().merge_table(&t)?;
    assert!(cfg.validate().is_err());

    let mut t = ConfigTable::new();
    t.set("", "stream_buffer", "70000")?;
    assert!(ServerConfig::default().merge_table(&t)?.validate().is_err());

    let mut t = ConfigTable::new();
    t.set("", "port", "not-a-port")?;
    assert!(ServerConfig::default().merge_table(&t).is_err());
    Ok(())
}
