use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use postsync::config::{Config, LogConfig};
use postsync::posts::{
  HttpTransport, MutationOutcome, NewPost, Post, PostId, PostMutation, PostPatch, PostsQuery,
  ReactionKind,
};
use postsync::PostsSync;

#[derive(Parser, Debug)]
#[command(name = "postsync")]
#[command(about = "Browse and edit posts through a local sync cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/postsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List posts, newest first
  List {
    /// Only posts by this user
    #[arg(short, long)]
    user: Option<u64>,
  },
  /// Show a single post
  Show { id: u64 },
  /// Create a post
  Add {
    #[arg(short, long)]
    title: String,
    #[arg(short, long, default_value = "")]
    body: String,
    #[arg(short, long)]
    user: u64,
  },
  /// Edit the title or body of a post
  Update {
    id: u64,
    #[arg(short, long)]
    title: Option<String>,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Add a reaction (thumbsUp, wow, heart, rocket, coffee)
  React { id: u64, kind: String },
  /// Delete a post
  Delete { id: u64 },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Keep the guard alive so buffered log lines are flushed on exit
  let _guard = init_logging(&config.log)?;

  let transport = HttpTransport::new(&config.api)?;
  let sync = PostsSync::with_retention(transport, config.cache.retention());

  run(&sync, args.command).await
}

fn init_logging(log: &LogConfig) -> Result<WorkerGuard> {
  let directory = log.directory()?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, "postsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&log.filter))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", log.filter, e))?;

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

async fn run(sync: &PostsSync, command: Command) -> Result<()> {
  match command {
    Command::List { user } => {
      let query = match user {
        Some(user_id) => PostsQuery::ByUser(user_id),
        None => PostsQuery::All,
      };
      let mut handle = sync.read(query);
      let posts = handle.settled().await?;
      if posts.is_empty() {
        println!("No posts");
      }
      for post in posts.iter() {
        println!("{}", summary_line(post));
      }
    }
    Command::Show { id } => {
      let post = load(sync, PostId(id)).await?;
      print_post(&post);
    }
    Command::Add { title, body, user } => {
      let handle = sync.mutate(PostMutation::Add(NewPost {
        title,
        body,
        user_id: user,
      }))?;
      report(handle.wait().await?);
    }
    Command::Update { id, title, body } => {
      let patch = PostPatch {
        title,
        body,
        ..Default::default()
      };
      if patch.is_empty() {
        return Err(eyre!("Nothing to update: pass --title and/or --body"));
      }
      load(sync, PostId(id)).await?;
      let handle = sync.mutate(PostMutation::Update {
        id: PostId(id),
        patch,
      })?;
      report(handle.wait().await?);
    }
    Command::React { id, kind } => {
      let kind: ReactionKind = kind.parse().map_err(|e: String| eyre!(e))?;
      load(sync, PostId(id)).await?;
      let handle = sync.mutate(PostMutation::AddReaction {
        id: PostId(id),
        kind,
      })?;
      report(handle.wait().await?);
    }
    Command::Delete { id } => {
      load(sync, PostId(id)).await?;
      let handle = sync.mutate(PostMutation::Delete(PostId(id)))?;
      report(handle.wait().await?);
    }
  }

  Ok(())
}

/// Fetch a post into the store so it can be shown or mutated.
async fn load(sync: &PostsSync, id: PostId) -> Result<Post> {
  let mut handle = sync.read(PostsQuery::ById(id));
  let data = handle.settled().await?;
  data
    .get(&id)
    .cloned()
    .ok_or_else(|| eyre!("Post {} not found", id))
}

fn report(outcome: MutationOutcome) {
  match outcome {
    MutationOutcome::Created(post) => {
      println!("Created post {}", post.id);
      print_post(&post);
    }
    MutationOutcome::Updated(post) => {
      println!("Updated post {}", post.id);
      print_post(&post);
    }
    MutationOutcome::Deleted(id) => println!("Deleted post {}", id),
  }
}

fn summary_line(post: &Post) -> String {
  format!(
    "{:>4}  {:<16}  user {:<3}  {}",
    post.id,
    post.date.format("%Y-%m-%d %H:%M"),
    post.user_id,
    post.title
  )
}

fn print_post(post: &Post) {
  println!("{}", summary_line(post));
  println!();
  println!("{}", post.body);
  println!();
  let reactions: Vec<String> = ReactionKind::ALL
    .iter()
    .map(|kind| format!("{} {}", kind.emoji(), post.reactions.get(*kind)))
    .collect();
  println!("{}", reactions.join("  "));
}
