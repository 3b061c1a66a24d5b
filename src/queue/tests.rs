use super::*;
use serde_json::json;
use std::fs;

fn write_queue(path: &Path, entries: serde_json::Value) {
    fs::write(path, serde_json::to_string_pretty(&entries).unwrap()).unwrap();
}

fn entry(timestamp: &str, message_id: u64, command: &str) -> serde_json::Value {
    json!({
        "timestamp": timestamp,
        "command": command,
        "original_command": command,
        "user_id": 42,
        "user_name": "alice#0001",
        "channel_id": 7,
        "message_id": message_id,
        "guild_id": null
    })
}

// =================================================================
// Entry identity and deserialization
// =================================================================

#[test]
fn id_joins_timestamp_and_numeric_message_id() {
    let e: CommandEntry =
        serde_json::from_value(entry("2024-05-01T09:30:00.123456", 1234567890123, "help")).unwrap();
    assert_eq!(e.id().as_str(), "2024-05-01T09:30:00.123456_1234567890123");
    assert_eq!(e.guild_id, None);
    assert_eq!(e.user_id, Some(OpaqueId::Number(42.into())));
}

#[test]
fn id_accepts_string_message_id() {
    let e: CommandEntry = serde_json::from_value(json!({
        "timestamp": "t1",
        "message_id": "m1",
        "command": "help"
    }))
    .unwrap();
    assert_eq!(e.id().as_str(), "t1_m1");
    assert!(e.original_command.is_none());
}

#[test]
fn parse_arg_prefers_numbers() {
    assert_eq!(OpaqueId::parse_arg("123"), OpaqueId::Number(123.into()));
    assert_eq!(OpaqueId::parse_arg("m1"), OpaqueId::Text("m1".into()));
}

// =================================================================
// Loading and pending computation
// =================================================================

#[test]
fn load_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let queue = CommandQueue::new(dir.path().join("command_queue.json"));
    assert!(queue.load().unwrap().is_empty());
}

#[test]
fn load_preserves_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("command_queue.json");
    write_queue(&path, json!([entry("t1", 1, "first"), entry("t2", 2, "second")]));
    let commands: Vec<String> = CommandQueue::new(&path)
        .load()
        .unwrap()
        .into_iter()
        .map(|e| e.command)
        .collect();
    assert_eq!(commands, ["first", "second"]);
}

#[test]
fn corrupted_queue_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("command_queue.json");
    fs::write(&path, r#"[{"timestamp": "t1", "message_id": 1, "comm"#).unwrap();
    let queue = CommandQueue::new(&path);
    assert!(matches!(queue.load(), Err(StoreError::Parse { .. })));
    assert!(queue.load_or_empty().is_empty());
    let processed = ProcessedSet::empty(dir.path().join("processed.json"));
    assert!(queue.pending(&processed).is_empty());
}

#[test]
fn entry_missing_required_field_makes_queue_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("command_queue.json");
    write_queue(&path, json!([entry("t1", 1, "ok"), {"timestamp": "t2", "command": "x"}]));
    assert!(CommandQueue::new(&path).load_or_empty().is_empty());
}

#[test]
fn pending_excludes_processed_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("command_queue.json");
    write_queue(
        &path,
        json!([entry("t1", 1, "a"), entry("t2", 2, "b"), entry("t3", 3, "c")]),
    );
    let mut processed = ProcessedSet::empty(dir.path().join("processed.json"));
    processed.mark_processed(&"t2_2".into()).unwrap();

    let pending: Vec<String> = CommandQueue::new(&path)
        .pending(&processed)
        .into_iter()
        .map(|e| e.id().to_string())
        .collect();
    assert_eq!(pending, ["t1_1", "t3_3"]);
}

// =================================================================
// Producer write path
// =================================================================

#[test]
fn append_creates_file() {
    let dir = tempfile::tempdir().unwrap();
    let queue = CommandQueue::new(dir.path().join("sub").join("command_queue.json"));
    let e = CommandEntry::submit("  help  ", OpaqueId::Number(9.into()), Submitter::default());
    queue.append(e.clone()).unwrap();

    let loaded = queue.load().unwrap();
    assert_eq!(loaded, vec![e]);
    assert_eq!(loaded[0].command, "help");
    assert_eq!(loaded[0].original_command.as_deref(), Some("  help  "));
}

#[test]
fn append_keeps_most_recent_hundred() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("command_queue.json");
    let initial: Vec<serde_json::Value> = (0..MAX_QUEUE_LEN as u64)
        .map(|i| entry(&format!("t{i}"), i, &format!("cmd {i}")))
        .collect();
    write_queue(&path, serde_json::Value::Array(initial));

    let queue = CommandQueue::new(&path);
    queue
        .append(CommandEntry::submit(
            "newest",
            OpaqueId::Text("m-new".into()),
            Submitter::default(),
        ))
        .unwrap();

    let loaded = queue.load().unwrap();
    assert_eq!(loaded.len(), MAX_QUEUE_LEN);
    assert_eq!(loaded[0].command, "cmd 1");
    assert_eq!(loaded.last().unwrap().command, "newest");
}

#[test]
fn append_refuses_to_overwrite_malformed_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("command_queue.json");
    fs::write(&path, "garbage").unwrap();
    let queue = CommandQueue::new(&path);
    let result = queue.append(CommandEntry::submit(
        "help",
        OpaqueId::Number(1.into()),
        Submitter::default(),
    ));
    assert!(result.is_err());
    assert_eq!(fs::read_to_string(&path).unwrap(), "garbage");
}

// =================================================================
// Sanitization
// =================================================================

#[test]
fn sanitize_trims_plain_commands() {
    assert_eq!(sanitize("  summarize the README \n"), "summarize the README");
}

#[test]
fn sanitize_removes_shell_metacharacters() {
    assert_eq!(sanitize("ls | grep foo; echo $(id)"), "ls [REMOVED] grep foo[REMOVED] echo [REMOVED]id)");
}

#[test]
fn sanitize_is_case_insensitive_for_commands() {
    assert_eq!(sanitize("SUDO reboot"), "[REMOVED] reboot");
    assert_eq!(sanitize("please Curl the page"), "please [REMOVED] the page");
}

#[test]
fn sanitize_double_redirect_is_removed_piecewise() {
    assert_eq!(sanitize("a >> b"), "a [REMOVED][REMOVED] b");
}

#[test]
fn sanitize_truncates_long_commands_by_chars() {
    let long = "é".repeat(600);
    let got = sanitize(&long);
    assert!(got.ends_with("..."));
    assert_eq!(got.chars().count(), 503);
}

#[test]
fn sanitize_keeps_exactly_500_chars() {
    let text = "a".repeat(500);
    assert_eq!(sanitize(&text), text);
}
