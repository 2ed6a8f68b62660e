use std::path::PathBuf;
use std::sync::Arc;

use agent_branch::BranchStore;
use agent_core::{
    ChatEvent, Conversation, EngineConfig, JsonlStorage, Message, MessageState, Role,
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::{mpsc, RwLock};

#[derive(Parser)]
#[command(name = "agent-cli")]
#[command(about = "Inspect conversations and switch between alternative responses")]
#[command(version)]
struct Cli {
    /// Directory holding conversation files (overrides config)
    #[arg(long, env = "BODHI_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored conversations
    List,
    /// Print a conversation as currently displayed
    Show {
        conversation: String,
        /// Print raw JSON instead
        #[arg(long)]
        json: bool,
    },
    /// Make an alternative of a message active (0 = original)
    Switch {
        conversation: String,
        message: String,
        index: usize,
    },
    /// List the alternatives of a message
    Branches {
        conversation: String,
        message: String,
    },
    /// Print the recorded event log of a conversation
    Events { conversation: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir.join("conversations"),
        None => EngineConfig::load().conversations_dir(),
    };
    log::debug!("Using conversation store at {:?}", data_dir);
    let storage = Arc::new(JsonlStorage::new(&data_dir));
    storage
        .init()
        .await
        .with_context(|| format!("failed to open {}", data_dir.display()))?;

    match cli.command {
        Commands::List => list_conversations(&storage).await,
        Commands::Show { conversation, json } => show_conversation(&storage, &conversation, json).await,
        Commands::Switch {
            conversation,
            message,
            index,
        } => switch_branch(storage, &conversation, &message, index).await,
        Commands::Branches {
            conversation,
            message,
        } => list_branches(&storage, &conversation, &message).await,
        Commands::Events { conversation } => show_events(&storage, &conversation).await,
    }
}

async fn load(storage: &JsonlStorage, conversation_id: &str) -> anyhow::Result<Conversation> {
    storage
        .load_conversation(conversation_id)
        .await?
        .ok_or_else(|| anyhow!("conversation {} not found", conversation_id))
}

fn preview(text: &str, limit: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > limit || text.lines().nth(1).is_some() {
        let cut: String = line.chars().take(limit).collect();
        format!("{cut}…")
    } else {
        line.to_string()
    }
}

fn role_label(role: Role) -> colored::ColoredString {
    match role {
        Role::System => "system".dimmed(),
        Role::User => "user".cyan(),
        Role::Assistant => "assistant".green(),
        Role::Tool => "tool".yellow(),
    }
}

fn state_label(state: MessageState) -> Option<colored::ColoredString> {
    match state {
        MessageState::Complete => None,
        MessageState::Aborted => Some("aborted".yellow()),
        MessageState::Error => Some("error".red()),
        MessageState::Draft => Some("draft".dimmed()),
        MessageState::Streaming => Some("streaming".dimmed()),
        MessageState::Invalid => Some("invalid".red()),
    }
}

async fn list_conversations(storage: &JsonlStorage) -> anyhow::Result<()> {
    let ids = storage.list_conversation_ids().await?;
    if ids.is_empty() {
        println!("{}", "No conversations".dimmed());
        return Ok(());
    }

    for id in ids {
        match storage.load_conversation(&id).await {
            Ok(Some(conversation)) => println!(
                "{}  {}  {} messages  {}",
                conversation.id.bold(),
                conversation.title.as_deref().unwrap_or("(untitled)"),
                conversation.messages.len(),
                conversation.updated_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
            ),
            Ok(None) => {}
            Err(error) => log::warn!("[{}] Skipping unreadable conversation: {}", id, error),
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    let mut header = format!("{} {}", role_label(message.role), message.id.dimmed());
    let info = BranchStore::branch_info(message);
    if info.has_branches {
        header.push_str(&format!(" [{}/{}]", info.current, info.total).magenta().to_string());
    }
    if let Some(state) = state_label(message.state) {
        header.push_str(&format!(" ({state})"));
    }
    println!("{header}");

    if let Some(reasoning) = BranchStore::active_reasoning(message) {
        println!("  {}", preview(reasoning, 80).dimmed().italic());
    }
    let content = BranchStore::active_content(message);
    if !content.is_empty() {
        for line in content.lines() {
            println!("  {line}");
        }
    }
    for call in BranchStore::active_tool_calls(message).unwrap_or_default() {
        let marker = match call.success {
            Some(true) => "✓".green(),
            Some(false) => "✗".red(),
            None if call.result.is_some() => "✓".green(),
            None => "…".dimmed(),
        };
        println!(
            "  {} {}({})",
            marker,
            call.function.name.yellow(),
            preview(&call.function.arguments, 60)
        );
    }
    println!();
}

async fn show_conversation(storage: &JsonlStorage, conversation_id: &str, json: bool) -> anyhow::Result<()> {
    let conversation = load(storage, conversation_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&conversation)?);
        return Ok(());
    }

    if let Some(title) = &conversation.title {
        println!("{}\n", title.bold());
    }
    for message in &conversation.messages {
        print_message(message);
    }
    Ok(())
}

async fn switch_branch(
    storage: Arc<JsonlStorage>,
    conversation_id: &str,
    message_id: &str,
    index: usize,
) -> anyhow::Result<()> {
    let conversation = Arc::new(RwLock::new(load(&storage, conversation_id).await?));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChatEvent>();
    let branches = BranchStore::new(storage.clone(), Arc::new(event_tx));

    if !branches
        .switch_to_branch_by_index(&conversation, message_id, index)
        .await
    {
        return Err(anyhow!(
            "cannot switch message {} to alternative {}",
            message_id,
            index
        ));
    }

    while let Ok(event) = event_rx.try_recv() {
        if matches!(event, ChatEvent::ConversationUpdated { .. }) {
            continue;
        }
        if let Err(error) = storage.append_event(conversation_id, &event).await {
            log::warn!("[{}] Failed to record event: {}", conversation_id, error);
        }
    }

    let conversation = conversation.read().await;
    if let Some(message) = conversation.message(message_id) {
        let info = BranchStore::branch_info(message);
        println!(
            "{} showing alternative {}/{}",
            "✅".green(),
            info.current,
            info.total
        );
        print_message(message);
    }
    Ok(())
}

async fn list_branches(storage: &JsonlStorage, conversation_id: &str, message_id: &str) -> anyhow::Result<()> {
    let conversation = load(storage, conversation_id).await?;
    let message = conversation
        .message(message_id)
        .ok_or_else(|| anyhow!("message {} not found", message_id))?;
    let info = BranchStore::branch_info(message);
    let active = info.current - 1;

    let marker = |index: usize| if index == active { "*".green() } else { " ".normal() };
    println!("{} 0  original  {}", marker(0), preview(&message.content, 60));
    for (position, branch) in message.branches.iter().enumerate() {
        let index = position + 1;
        let state = branch
            .state()
            .map(|state| format!(" {}", state.as_str()))
            .unwrap_or_default();
        let first = branch
            .first_message()
            .map(|first| preview(&first.content, 60))
            .unwrap_or_default();
        println!(
            "{} {}  {:?}{}  {}  {} messages  {}",
            marker(index),
            index,
            branch.kind,
            state,
            branch.id.dimmed(),
            branch.messages.len(),
            first
        );
        if let Some(task) = &branch.metadata.task {
            println!("      task: {}", preview(task, 70).dimmed());
        }
    }
    Ok(())
}

async fn show_events(storage: &JsonlStorage, conversation_id: &str) -> anyhow::Result<()> {
    let events = storage.load_events(conversation_id).await?;
    if events.is_empty() {
        println!("{}", "No recorded events".dimmed());
    }
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
