//! Integration test: command semantics through `Server::handle_request`.
//!
//! Exercises whole request bodies the way the reactor hands them over,
//! without a network in between.

use std::path::Path;

use tempfile::TempDir;
use tris::protocol::{decode_batch, parse_request, Field, FieldType};
use tris::session::SessionId;
use tris::{RefCountTrie, Reply, Server, ServerConfig, DEFAULT_DB};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config_for(dir: &Path) -> ServerConfig {
    ServerConfig {
        data_dir: dir.to_path_buf(),
        persist_ops_limit: 0,
        persist_interval_secs: 0,
        ..ServerConfig::default()
    }
}

fn start_server(dir: &Path) -> Server {
    let server = Server::new(config_for(dir)).unwrap();
    server.initialize().unwrap();
    server
}

fn send(server: &Server, id: &str, body: &str) -> Vec<Reply> {
    let expected = parse_request(body.as_bytes()).len();
    let bytes = server.handle_request(&SessionId(id.as_bytes().to_vec()), body.as_bytes());
    decode_batch(&bytes, expected).unwrap()
}

fn send_one(server: &Server, id: &str, line: &str) -> Reply {
    send(server, id, line).remove(0)
}

fn fail_message(reply: &Reply) -> String {
    assert!(!reply.is_ok(), "expected FAIL, got {:?}", reply);
    assert_eq!(reply.signature, vec![FieldType::String]);
    reply.first().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// Tests: Basic scenario
// ---------------------------------------------------------------------------

#[test]
fn create_select_add_count_delete() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    assert!(send_one(&server, "c1", "CREATE foo").is_ok());
    assert!(send_one(&server, "c1", "SELECT foo").is_ok());
    assert_eq!(send_one(&server, "c1", "ADD bar").first(), Some(&Field::Int(1)));
    assert_eq!(send_one(&server, "c1", "ADD bar").first(), Some(&Field::Int(2)));
    assert_eq!(send_one(&server, "c1", "HASCOUNT bar").first(), Some(&Field::Int(2)));
    assert_eq!(send_one(&server, "c1", "DEL bar").first(), Some(&Field::Bool(true)));
    assert_eq!(send_one(&server, "c1", "HAS bar").first(), Some(&Field::Bool(false)));
    assert_eq!(send_one(&server, "c1", "HASCOUNT bar").first(), Some(&Field::Int(0)));

    assert!(dir.path().join("trie_foo").exists());
}

#[test]
fn same_scenario_as_one_batch() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let replies = send(
        &server,
        "c1",
        "CREATE foo\nSELECT foo\nADD bar\nADD bar\nHASCOUNT bar\nDEL bar\nHAS bar",
    );

    assert_eq!(replies.len(), 7);
    assert!(replies.iter().all(Reply::is_ok));
    assert_eq!(replies[0].signature, Vec::<FieldType>::new());
    assert_eq!(replies[4].first(), Some(&Field::Int(2)));
    assert_eq!(replies[5].first(), Some(&Field::Bool(true)));
    assert_eq!(replies[6].first(), Some(&Field::Bool(false)));
}

#[test]
fn lower_case_commands_are_accepted() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    assert_eq!(send_one(&server, "c1", "ping").first(), Some(&Field::text("heartbeat")));
    assert_eq!(send_one(&server, "c1", "hasPrefix x").first(), Some(&Field::Bool(false)));
}

// ---------------------------------------------------------------------------
// Tests: Batch isolation
// ---------------------------------------------------------------------------

#[test]
fn failing_command_does_not_stop_batch() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let replies = send(&server, "c1", "SELECT nope\nADD x\nNOSUCH\nHAS x");

    assert_eq!(fail_message(&replies[0]), "Database nope does not exist.");
    assert_eq!(replies[1].first(), Some(&Field::Int(1)));
    assert_eq!(fail_message(&replies[2]), "Unknown Command NOSUCH.");
    assert_eq!(replies[3].first(), Some(&Field::Bool(true)));

    // still on the default database
    let default = server.databases().get_database(DEFAULT_DB).unwrap();
    assert!(default.store().has("x"));
}

#[test]
fn missing_arguments_fail_per_command() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let replies = send(&server, "c1", "IMPORT only-one\nHAS\nPING");
    assert!(!replies[0].is_ok());
    assert!(!replies[1].is_ok());
    assert!(replies[2].is_ok());
}

// ---------------------------------------------------------------------------
// Tests: Sessions
// ---------------------------------------------------------------------------

#[test]
fn select_is_per_session() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    send(&server, "a", "CREATE left\nCREATE right\nSELECT left\nADD k");
    send(&server, "b", "SELECT right");

    assert_eq!(send_one(&server, "b", "HAS k").first(), Some(&Field::Bool(false)));
    assert_eq!(send_one(&server, "a", "HAS k").first(), Some(&Field::Bool(true)));

    // a failed SELECT keeps the previous database
    send_one(&server, "a", "SELECT missing");
    assert_eq!(send_one(&server, "a", "HAS k").first(), Some(&Field::Bool(true)));
}

#[test]
fn new_session_starts_on_default_database() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    send(&server, "a", "ADD shared");
    assert_eq!(send_one(&server, "b", "HASCOUNT shared").first(), Some(&Field::Int(1)));
}

#[test]
fn exit_removes_session_after_drain() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    send(&server, "a", "CREATE other\nSELECT other");
    assert!(send_one(&server, "a", "EXIT").is_ok());
    assert_eq!(server.sessions().len(), 1);

    assert_eq!(server.sessions().drain_removals(), 1);
    assert_eq!(server.sessions().len(), 0);

    // the identity comes back as a fresh session on the default database
    send(&server, "a", "ADD fresh");
    let default = server.databases().get_database(DEFAULT_DB).unwrap();
    assert!(default.store().has("fresh"));
}

#[test]
fn timing_toggles_flag() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    send_one(&server, "a", "TIMING");
    let session = server.sessions().get(&SessionId(b"a".to_vec())).unwrap();
    assert!(session.lock().show_exec_time);

    send_one(&server, "a", "TIMING");
    assert!(!session.lock().show_exec_time);
}

// ---------------------------------------------------------------------------
// Tests: Write accounting
// ---------------------------------------------------------------------------

#[test]
fn only_successful_writes_are_counted() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    send(&server, "a", "CREATE w\nSELECT w\nADD x\nADD x\nHAS x\nMEMBERS\nTREE\nDEL x\nADD");
    let db = server.databases().get_database("w").unwrap();
    assert_eq!(db.ops_count(), 3);

    // ADMIN and READ commands never count
    send(&server, "a", "DBINFO\nINFO\nHASCOUNT x\nPREFIXMEMBERS x");
    assert_eq!(db.ops_count(), 3);
}

#[test]
fn dbinfo_reports_counters() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let replies = send(&server, "a", "CREATE w\nSELECT w\nADD x\nDBINFO");
    let text = replies[3].first().unwrap().to_string();
    assert!(text.starts_with("DBINFO for database w:"));
    assert!(text.contains(" OpsCount: 1\n"));
    assert!(text.contains(" LastPersistOpsCount: 0\n"));
}

// ---------------------------------------------------------------------------
// Tests: Listing
// ---------------------------------------------------------------------------

#[test]
fn members_are_key_count_rows_in_order() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let replies = send(&server, "a", "ADD pear\nADD apple\nADD apple\nADD apricot\nMEMBERS\nPREFIXMEMBERS ap");

    let members = &replies[4];
    assert_eq!(members.signature, vec![FieldType::String, FieldType::Int]);
    assert_eq!(
        members.payload,
        vec![
            Field::text("apple"),
            Field::Int(2),
            Field::text("apricot"),
            Field::Int(1),
            Field::text("pear"),
            Field::Int(1),
        ]
    );
    assert_eq!(replies[5].logical_rows().count(), 2);
}

#[test]
fn info_lists_user_databases() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let replies = send(&server, "a", "CREATE beta\nCREATE alpha\nSELECT beta\nINFO");
    let text = replies[3].first().unwrap().to_string();
    assert!(text.starts_with("SERVER\n"));
    assert!(text.contains("    1) alpha (keys: 0, ops: 0, persisted at: 0)\n"));
    assert!(text.contains("    2) * beta (keys: 0, ops: 0, persisted at: 0)\n"));
    assert!(text.contains("Requests Total: "));
    assert!(text.contains("Avg Command Time: "));
    assert!(text.contains("\nCLIENT\n"));
}

#[test]
fn help_shows_command_text() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let text = send_one(&server, "a", "HELP add").first().unwrap().to_string();
    assert!(text.contains("ADD <key>"));

    let text = send_one(&server, "a", "HELP bogus").first().unwrap().to_string();
    assert!(text.starts_with("Unknown Command BOGUS."));
}

// ---------------------------------------------------------------------------
// Tests: Database lifecycle
// ---------------------------------------------------------------------------

#[test]
fn create_twice_fails() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    assert!(send_one(&server, "a", "CREATE dup").is_ok());
    assert_eq!(fail_message(&send_one(&server, "a", "CREATE dup")), "Database dup already exists.");
    assert!(!send_one(&server, "a", "CREATE ../escape").is_ok());
}

#[test]
fn save_is_refused_on_default_database() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    let reply = send_one(&server, "a", "SAVE");
    assert_eq!(fail_message(&reply), "Manually saving the default database is not permitted.");
}

#[test]
fn save_backs_up_then_persists() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    send(&server, "a", "CREATE s\nSELECT s\nADD first\nSAVE\nADD second");
    assert!(send_one(&server, "a", "SAVE").is_ok());

    // the backup holds the file as it was before the second SAVE
    let backup = RefCountTrie::load_from_file(&dir.path().join("s_bak").join("s")).unwrap();
    assert!(backup.has("first"));
    assert!(!backup.has("second"));

    let current = RefCountTrie::load_from_file(&dir.path().join("trie_s")).unwrap();
    assert!(current.has("second"));
}

#[test]
fn import_creates_database_from_dump() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("seed.dump");
    let seed = RefCountTrie::new();
    seed.add("alpha");
    seed.add("alpha");
    seed.persist_to_file(&dump).unwrap();

    let server = start_server(dir.path());
    let body = format!("IMPORT {} copy\nSELECT copy\nHASCOUNT alpha", dump.display());
    let replies = send(&server, "a", &body);

    assert!(replies[0].is_ok());
    assert_eq!(replies[2].first(), Some(&Field::Int(2)));
    assert!(dir.path().join("trie_copy").exists());
}

#[test]
fn failed_import_is_rolled_back() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());
    let missing = dir.path().join("missing.dump");

    let reply = send_one(&server, "a", &format!("IMPORT {} copy", missing.display()));
    assert!(fail_message(&reply).starts_with("Database import failed:"));
    assert!(!server.databases().database_exists("copy"));
    assert!(!send_one(&server, "a", "SELECT copy").is_ok());

    let dump = dir.path().join("good.dump");
    RefCountTrie::new().persist_to_file(&dump).unwrap();
    assert!(send_one(&server, "a", &format!("IMPORT {} copy", dump.display())).is_ok());
}

#[test]
fn merge_adds_counts_and_persists() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("extra.dump");
    let extra = RefCountTrie::new();
    extra.add("shared");
    extra.add("theirs");
    extra.persist_to_file(&dump).unwrap();

    let server = start_server(dir.path());
    send(&server, "a", "CREATE m\nSELECT m\nADD shared");
    assert!(send_one(&server, "a", &format!("MERGE {}", dump.display())).is_ok());

    assert_eq!(send_one(&server, "a", "HASCOUNT shared").first(), Some(&Field::Int(2)));
    let db = server.databases().get_database("m").unwrap();
    assert_eq!(db.ops_count(), 2);
    assert_eq!(db.last_persist_ops_count(), 2);

    let on_disk = RefCountTrie::load_from_file(&dir.path().join("trie_m")).unwrap();
    assert!(on_disk.has("theirs"));
}

#[test]
fn merge_of_bad_file_fails() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());
    let reply = send_one(&server, "a", "MERGE /definitely/not/here");
    assert!(fail_message(&reply).starts_with("Database merge failed:"));
}

// ---------------------------------------------------------------------------
// Tests: Restart
// ---------------------------------------------------------------------------

#[test]
fn databases_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let server = start_server(dir.path());
        send(&server, "a", "CREATE keep\nSELECT keep\nADD k1\nADD k1\nADD k2");
        let report = server.databases().persist_all();
        assert_eq!(report.written, vec!["keep"]);
    }

    let server = start_server(dir.path());
    assert_eq!(server.databases().database_names(), vec![DEFAULT_DB, "keep"]);
    let replies = send(&server, "a", "SELECT keep\nHASCOUNT k1\nHAS k2");
    assert_eq!(replies[1].first(), Some(&Field::Int(2)));
    assert_eq!(replies[2].first(), Some(&Field::Bool(true)));
}

#[test]
fn shutdown_command_requests_stop() {
    let dir = TempDir::new().unwrap();
    let server = start_server(dir.path());

    assert!(server.is_running());
    assert!(send_one(&server, "a", "SHUTDOWN").is_ok());
    assert!(!server.is_running());
}
