use super::{CliError, EXIT_SUCCESS};
use cairn_core::Conn;
use cairn_watch::Notification;
use tracing::debug;

/// Print notifications until interrupted, or until `count` changes have
/// been seen.
pub async fn run(
    conn: &Conn,
    collection: &str,
    id: Option<&str>,
    count: Option<usize>,
    json: bool,
) -> Result<u8, CliError> {
    let state = conn.state();
    let mut sub = match id {
        Some(id) => state.watch_document(collection, id)?,
        None => state.watch_collection(collection)?,
    };
    let mut seen = 0;
    loop {
        let note = tokio::select! {
            note = sub.recv() => note,
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                return Ok(EXIT_SUCCESS);
            }
        };
        match note {
            Some(Notification::Changes(changes)) => {
                for change in &changes {
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({
                                "seq": change.seq,
                                "collection": change.collection,
                                "id": change.id,
                                "revno": change.revno,
                            })
                        );
                    } else {
                        match change.revno {
                            Some(revno) => println!(
                                "{} {}/{} revno {revno}",
                                change.seq, change.collection, change.id
                            ),
                            None => println!(
                                "{} {}/{} removed",
                                change.seq, change.collection, change.id
                            ),
                        }
                    }
                }
                seen += changes.len();
            }
            Some(Notification::Resync) => {
                if json {
                    println!("{}", serde_json::json!({ "resync": true }));
                } else {
                    println!("resync: changes may have been missed");
                }
            }
            None => return Err(CliError::Failure("watcher stopped".to_owned())),
        }
        if count.is_some_and(|n| seen >= n) {
            return Ok(EXIT_SUCCESS);
        }
    }
}
