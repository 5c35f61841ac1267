mod config;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use userdeck::api::types::{Role, UserDraft, UserType};
use userdeck::api::HttpUsersApi;
use userdeck::cache::{CacheStore, DatasetSnapshot, MemoryStorage, SqliteStorage, SystemClock};
use userdeck::mutation::{Confirm, ConfirmPrompt, MutationOutcome, SaveRequest};
use userdeck::ListSession;

#[derive(Parser, Debug)]
#[command(name = "userdeck")]
#[command(about = "Browse and administer users from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/userdeck/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Users API base URL, overriding the config file
  #[arg(long, global = true)]
  url: Option<String>,

  /// Rows per page, overriding the config file
  #[arg(long, global = true)]
  page_size: Option<u32>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print one page of users
  List {
    /// Page and filters, e.g. "page=2&role=admin&search=ada"
    #[arg(short, long, default_value = "")]
    query: String,
  },
  /// Toggle the verified flag of a user on the selected page
  Verify {
    id: String,
    #[arg(short, long, default_value = "")]
    query: String,
  },
  /// Change the role of users on the selected page
  SetRole {
    role: Role,
    #[arg(required = true)]
    ids: Vec<String>,
    #[arg(short, long, default_value = "")]
    query: String,
    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,
  },
  /// Delete users on the selected page
  Delete {
    #[arg(required = true)]
    ids: Vec<String>,
    #[arg(short, long, default_value = "")]
    query: String,
    /// Skip the first confirmation prompt
    #[arg(long)]
    yes: bool,
    /// Skip the irreversibility prompt
    #[arg(long)]
    really: bool,
  },
  /// Create a user
  Create {
    #[arg(long)]
    email: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "member")]
    role: Role,
    #[arg(long, default_value = "individual")]
    user_type: UserType,
    #[arg(long)]
    verified: bool,
  },
}

/// Answers prompts from command-line flags, asking on the terminal otherwise
struct CliConfirm {
  yes: bool,
  really: bool,
}

impl Confirm for CliConfirm {
  fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
    let (question, preapproved) = match prompt {
      ConfirmPrompt::ChangeRole { count, role } => {
        (format!("Change role of {} user(s) to {}?", count, role), self.yes)
      }
      ConfirmPrompt::Delete { count } => (format!("Delete {} user(s)?", count), self.yes),
      ConfirmPrompt::DeleteIrreversible { count } => (
        format!("Deleting {} user(s) cannot be undone. Continue?", count),
        self.really,
      ),
    };
    if preapproved {
      return true;
    }

    eprint!("{} [y/N] ", question);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
      return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
  }
}

fn print_page(snapshot: &DatasetSnapshot) {
  for user in &snapshot.items {
    println!(
      "{:<10} {:<32} {:<24} {:<10} {:<10} {}",
      user.id,
      user.email,
      user.name,
      user.role,
      user.user_type,
      if user.verified { "verified" } else { "-" }
    );
  }
  println!(
    "page {}/{} ({} users)",
    snapshot.page,
    snapshot.total_pages.max(1),
    snapshot.total_items
  );
}

fn print_outcome(outcome: MutationOutcome) {
  match outcome {
    MutationOutcome::Applied => println!("Done."),
    MutationOutcome::Cancelled => println!("Cancelled, nothing was changed."),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = logging::init()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override from the command line
  if let Some(url) = args.url {
    config.api.url = url;
  }
  if let Some(page_size) = args.page_size {
    config.page_size = page_size;
  }
  config.validate()?;

  let api = HttpUsersApi::new(
    &config.api.url,
    config::Config::get_api_token(),
    config.request_timeout(),
  )?;

  let clock = Arc::new(SystemClock);
  let store = if config.cache.persist {
    let path = match &config.cache.path {
      Some(path) => path.clone(),
      None => SqliteStorage::default_path()?,
    };
    info!(path = %path.display(), "Using persistent page cache");
    CacheStore::new(SqliteStorage::open(&path)?, clock, config.ttl())
  } else {
    CacheStore::new(MemoryStorage::new(), clock, config.ttl())
  };

  let (mut session, _events) = ListSession::new(Arc::new(api), store, config.session_options());

  let result = run(&mut session, args.command).await;

  // Let prefetches land in a persistent cache before exiting
  if config.cache.persist {
    session.drain().await;
  } else {
    session.close();
  }

  result
}

async fn run(session: &mut ListSession, command: Command) -> Result<()> {
  match command {
    Command::List { query } => {
      let page = session.open(&query).await?;
      print_page(&page.snapshot);
      println!("?{}", session.query_string());
    }
    Command::Verify { id, query } => {
      session.open(&query).await?;
      let outcome = session.toggle_verified(&id).await?;
      print_outcome(outcome);
    }
    Command::SetRole {
      role,
      ids,
      query,
      yes,
    } => {
      session.open(&query).await?;
      let confirm = CliConfirm { yes, really: false };
      let outcome = session.bulk_set_role(&ids, role, &confirm).await?;
      print_outcome(outcome);
    }
    Command::Delete {
      ids,
      query,
      yes,
      really,
    } => {
      session.open(&query).await?;
      let confirm = CliConfirm { yes, really };
      let outcome = session.bulk_delete(&ids, &confirm).await?;
      print_outcome(outcome);
    }
    Command::Create {
      email,
      name,
      role,
      user_type,
      verified,
    } => {
      let draft = UserDraft {
        role,
        user_type,
        verified,
        ..UserDraft::new(email, name)
      };
      let user = session
        .save(SaveRequest::Create(draft))
        .await
        .map_err(|e| eyre!("Could not create user: {}", e))?;
      println!("Created {} <{}> as {}", user.id, user.email, user.role);
    }
  }
  Ok(())
}
