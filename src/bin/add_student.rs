//! add_student - credential provisioning tool
//!
//! Inserts a student row (username, roll number, password digest) into the
//! proctord database so the `/login` endpoint can authenticate them.

use anyhow::Result;
use clap::Parser;

use proctord::{hash_password, ProctorStore, SqliteProctorStore};

#[derive(Parser, Debug)]
#[command(name = "add_student", about = "Provision login credentials for a student")]
struct Args {
    #[arg(long, env = "PROCTOR_DB_PATH", default_value = "proctor.db")]
    db_path: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    roll_number: String,
    /// Stored as a SHA-256 digest, never in plaintext.
    #[arg(long)]
    password: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut store = SqliteProctorStore::open(&args.db_path)?;
    store.add_student(
        &args.username,
        &args.roll_number,
        &hash_password(&args.password),
    )?;
    log::info!(
        "student '{}' (roll {}) added to {}",
        args.username,
        args.roll_number,
        args.db_path
    );
    Ok(())
}
