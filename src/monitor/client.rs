//! Per-connection query handling.
//!
//! One worker thread reads a single NUL-terminated command per connection:
//! `quit`, `flush`, or a token. A token query synchronizes with the listener
//! (so the answer reflects every event queued before the query arrived),
//! pins the head batch, and streams the changed paths newest-first. Clients
//! whose token cannot be honored get a *trivial* response: a fresh token
//! plus a `/` sentinel meaning "assume everything is dirty".

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::ipc::Handler;
use crate::ipc::Outcome;
use crate::ipc::Reply;

use super::cookie::CookieResult;
use super::state::MonitorState;
use super::token::TOKEN_PREFIX;
use super::token::Token;

/// Sentinel line of a trivial response.
const TRIVIAL_SENTINEL: &str = "/";

/// IPC-facing half of the daemon.
#[derive(Debug)]
pub struct ClientHandler {
    state: Arc<MonitorState>,
    git_dir: PathBuf,
}

impl ClientHandler {
    /// Handler answering queries from `state`, with cookies placed in
    /// `git_dir`.
    pub fn new(state: Arc<MonitorState>, git_dir: &Path) -> Self {
        ClientHandler {
            state,
            git_dir: git_dir.to_path_buf(),
        }
    }

    fn current_token(&self) -> String {
        let shared = self.state.lock();
        Token {
            session_id: shared.token.session_id.clone(),
            seq_nr: shared.token.response_seq(),
        }
        .to_string()
    }

    fn send_trivial(&self, reply: &mut Reply<'_>, token: &str) {
        send_line(reply, token);
        send_line(reply, TRIVIAL_SENTINEL);
    }

    /// The V2 query path.
    fn query(&self, client: &Token, reply: &mut Reply<'_>) {
        // Phase 1: decide under the lock whether the client's token can be
        // answered incrementally at all.
        {
            let shared = self.state.lock();
            if shared.token.session_id != client.session_id {
                // Daemon restarted or resynced since the client last asked.
                drop(shared);
                self.send_trivial(reply, &self.current_token());
                return;
            }
            match shared.token.tail_seq() {
                None => {
                    let token = Token {
                        session_id: shared.token.session_id.clone(),
                        seq_nr: 0,
                    };
                    drop(shared);
                    if client.seq_nr == 0 {
                        // Nothing happened yet: empty response, no sentinel.
                        send_line(reply, &token.to_string());
                    } else {
                        self.send_trivial(reply, &token.to_string());
                    }
                    return;
                }
                Some(tail_seq) if client.seq_nr < tail_seq => {
                    // History was truncated past the client's position.
                    drop(shared);
                    self.send_trivial(reply, &self.current_token());
                    return;
                }
                Some(_) => {}
            }
        }

        // Phase 2: make sure every event queued before this query has been
        // published. Platforms with a wait-for-idle primitive could use it
        // here; the cookie flush works everywhere.
        match self.state.sync_with_listener(&self.git_dir) {
            CookieResult::Seen => {}
            result => {
                debug!("cookie sync failed ({result:?}), responding trivially");
                self.send_trivial(reply, &self.current_token());
                return;
            }
        }

        // Phase 3: pin the head we are about to walk and snapshot it.
        let (sid, head_seq, response, snapshot) = {
            let mut shared = self.state.lock();
            if shared.token.session_id != client.session_id {
                // A resync raced the cookie wait.
                drop(shared);
                self.send_trivial(reply, &self.current_token());
                return;
            }
            let now = self.state.now_ms();
            let Some(head) = shared.token.head().cloned() else {
                send_line(
                    reply,
                    &Token {
                        session_id: shared.token.session_id.clone(),
                        seq_nr: 0,
                    }
                    .to_string(),
                );
                return;
            };
            head.pin(now);
            let head_seq = head.seq_nr;
            shared.token.client_ref_count += 1;
            (
                shared.token.session_id.clone(),
                head_seq,
                shared.token.response_seq(),
                shared.token.snapshot(),
            )
        };

        // Phase 4: emit without the lock. New batches may be prepended and a
        // resync may retire the whole session concurrently; the snapshot is
        // fixed and that is the point.
        test_client_delay();
        send_line(
            reply,
            &Token {
                session_id: sid.clone(),
                seq_nr: response,
            }
            .to_string(),
        );
        let mut sent: HashSet<&str> = HashSet::new();
        for batch in snapshot.iter().filter(|b| b.seq_nr >= client.seq_nr) {
            for path in &batch.paths {
                if sent.insert(path.as_ref()) {
                    send_line(reply, path);
                }
            }
        }

        // Phase 5: drop the pin taken in phase 3. The counter lives on the
        // token instance that was pinned, which a resync may have retired in
        // the meantime.
        self.state.finish_query(&sid, head_seq);
    }
}

impl Handler for ClientHandler {
    fn handle(&self, command: &[u8], reply: &mut Reply<'_>) -> Outcome {
        if command == b"quit" {
            return Outcome::Quit;
        }
        if command == b"flush" {
            let session = self.state.force_resync();
            self.send_trivial(reply, &Token { session_id: session, seq_nr: 0 }.to_string());
            return Outcome::Continue;
        }

        let Some(token) = std::str::from_utf8(command)
            .ok()
            .filter(|t| t.starts_with(TOKEN_PREFIX))
            .and_then(Token::parse)
        else {
            // V1 timestamps and garbage alike get a fresh start.
            debug!(
                "unrecognized client token {:?}, responding trivially",
                String::from_utf8_lossy(command)
            );
            self.send_trivial(reply, &self.current_token());
            return Outcome::Continue;
        };

        self.query(&token, reply);
        Outcome::Continue
    }
}

fn send_line(reply: &mut Reply<'_>, line: &str) {
    let mut payload = Vec::with_capacity(line.len() + 1);
    payload.extend_from_slice(line.as_bytes());
    payload.push(0);
    reply.send(&payload);
}

/// Honor `GIT_TEST_FSMONITOR_CLIENT_DELAY` (milliseconds): stretch the
/// window in which a query holds a pinned head without the lock, so tests
/// can race a resync against it.
fn test_client_delay() {
    if let Some(ms) = std::env::var("GIT_TEST_FSMONITOR_CLIENT_DELAY")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}
