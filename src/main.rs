use colored::Colorize;
use lmchat::{
    archive,
    config::{get_config, initialize_config},
    logging::init_logging,
    session::{TurnEvent, TurnState},
    storage::JsonFileStorage,
    ChatError, ChatSession, CheckpointPolicy, CompletionClient, ConversationStore, Role,
    TurnStatus,
};
use log::{error, info};
use rustyline::{error::ReadlineError, DefaultEditor};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const HELP: &str = "\
/new                 start a new conversation
/list                list conversations (most recent first)
/select <n|id>       switch conversation
/delete [n|id]       delete a conversation (default: current)
/clear               empty the current conversation
/export [dir]        write all conversations to a dated JSON archive
/import <file>       merge conversations from an archive
/models              list models on the server
/model <id>          choose the model
/temp <value>        set temperature (0.0 - 1.5)
/system <text>       set the system prompt (empty to disable)
/config              show current settings
/help                show this help
/quit                exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_config()?;
    let config = get_config();
    std::fs::create_dir_all(&config.data_dir)?;
    let _logger = init_logging(&config.log_level, &config.data_dir)?;
    info!("Starting against {}", config.base_url());

    let store = ConversationStore::bootstrap(Box::new(JsonFileStorage::new(&config.data_dir)));
    let store = Arc::new(Mutex::new(store));
    let client = CompletionClient::from_config(&config);
    let session = ChatSession::new(
        store.clone(),
        Arc::new(client.clone()),
        CheckpointPolicy::from_config(&config),
    );

    println!(
        "{} {}",
        "lmchat".bold().cyan(),
        format!("· {} · /help for commands", config.base_url()).dimmed()
    );
    print_current(&store).await;

    let mut rl = DefaultEditor::new()?;
    loop {
        let line = match rl.readline(&format!("{} ", "›".cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                error!("Readline failed: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line);

        if let Some(command) = line.strip_prefix('/') {
            let (name, arg) = match command.split_once(char::is_whitespace) {
                Some((name, arg)) => (name, arg.trim()),
                None => (command, ""),
            };
            if name == "quit" || name == "exit" {
                break;
            }
            if let Err(e) = run_command(name, arg, &store, &client).await {
                println!("{}", error_text(&e));
            }
            continue;
        }

        send(&session, line).await;
    }

    Ok(())
}

async fn send(session: &ChatSession, input: &str) {
    let mut stdout = std::io::stdout();
    let result = session
        .send_message(input, |event| match event {
            TurnEvent::State(TurnState::Streaming) => {
                print!("{} ", "assistant ›".green().bold());
                let _ = stdout.flush();
            }
            TurnEvent::Fragment(fragment) => {
                print!("{}", fragment);
                let _ = stdout.flush();
            }
            _ => {}
        })
        .await;

    match result {
        Ok(outcome) => {
            println!();
            match outcome.status {
                TurnStatus::Finalized => {}
                TurnStatus::Errored(message) => println!("{}", message.red()),
                TurnStatus::Abandoned => {
                    println!("{}", "Conversation was removed; reply discarded.".yellow())
                }
            }
        }
        Err(ChatError::MissingModel) => {
            println!("{}", "No model selected. Use /models and /model <id>.".yellow())
        }
        Err(e) => println!("{}", error_text(&e)),
    }
}

fn error_text(err: &ChatError) -> colored::ColoredString {
    if err.is_user_facing() {
        err.to_string().red()
    } else {
        err.to_string().yellow()
    }
}

async fn run_command(
    name: &str,
    arg: &str,
    store: &Arc<Mutex<ConversationStore>>,
    client: &CompletionClient,
) -> Result<(), ChatError> {
    match name {
        "help" => println!("{}", HELP),
        "new" => {
            store.lock().await.create_conversation();
            print_current(store).await;
        }
        "list" => {
            let store = store.lock().await;
            for (i, conversation) in store.list().iter().enumerate() {
                let marker = if store.current_id() == Some(conversation.id.as_str()) {
                    "*".green().to_string()
                } else {
                    " ".to_string()
                };
                println!(
                    "{} {:>2}. {} {}",
                    marker,
                    i + 1,
                    conversation.title,
                    format!(
                        "({} messages, {})",
                        conversation.messages.len(),
                        conversation.updated_at.format("%Y-%m-%d %H:%M")
                    )
                    .dimmed()
                );
            }
        }
        "select" => {
            let id = resolve(store, arg).await?;
            store.lock().await.select(&id)?;
            print_current(store).await;
        }
        "delete" => {
            if arg.is_empty() {
                store.lock().await.delete_current()?;
            } else {
                let id = resolve(store, arg).await?;
                store.lock().await.delete(&id)?;
            }
            print_current(store).await;
        }
        "clear" => {
            store.lock().await.clear_current()?;
            println!("{}", "Conversation cleared.".dimmed());
        }
        "export" => {
            let dir = if arg.is_empty() {
                std::env::current_dir()?
            } else {
                PathBuf::from(arg)
            };
            let path = archive::export_to_dir(&*store.lock().await, &dir)?;
            println!("Exported to {}", path.display());
        }
        "import" => {
            if arg.is_empty() {
                return Err(ChatError::archive_error("usage: /import <file>"));
            }
            let count = archive::import_file(&mut *store.lock().await, Path::new(arg))?;
            println!("Imported {} conversation(s).", count);
            print_current(store).await;
        }
        "models" => {
            let models = client.list_models().await?;
            let selected = store.lock().await.config().model.clone();
            if models.is_empty() {
                println!("{}", "The server reports no models.".yellow());
            }
            for model in models {
                if model == selected {
                    println!("{} {}", "*".green(), model);
                } else {
                    println!("  {}", model);
                }
            }
        }
        "model" => {
            let mut store = store.lock().await;
            let mut config = store.config().clone();
            config.model = arg.to_string();
            store.update_config(config)?;
        }
        "temp" => {
            let temperature: f32 = arg
                .parse()
                .map_err(|_| ChatError::config_error(format!("Not a number: '{}'", arg)))?;
            let mut store = store.lock().await;
            let mut config = store.config().clone();
            config.temperature = temperature;
            store.update_config(config)?;
        }
        "system" => {
            let mut store = store.lock().await;
            let mut config = store.config().clone();
            config.system_prompt = arg.to_string();
            store.update_config(config)?;
        }
        "config" => {
            let store = store.lock().await;
            let config = store.config();
            println!("endpoint     {}", client.base_url());
            println!(
                "model        {}",
                if config.model.is_empty() { "(none)" } else { config.model.as_str() }
            );
            println!("temperature  {}", config.temperature);
            println!("system       {}", config.system_prompt);
        }
        other => println!("Unknown command '/{}'. Try /help.", other),
    }
    Ok(())
}

/// Accepts a 1-based position in `/list` order or a conversation id.
async fn resolve(store: &Arc<Mutex<ConversationStore>>, arg: &str) -> Result<String, ChatError> {
    let store = store.lock().await;
    if let Ok(n) = arg.parse::<usize>() {
        if let Some(conversation) = n.checked_sub(1).and_then(|i| store.list().get(i).copied()) {
            return Ok(conversation.id.clone());
        }
    }
    if store.contains(arg) {
        return Ok(arg.to_string());
    }
    Err(ChatError::ConversationNotFound { id: arg.to_string() })
}

async fn print_current(store: &Arc<Mutex<ConversationStore>>) {
    let store = store.lock().await;
    let Some(conversation) = store.current() else {
        return;
    };
    println!("{} {}", "──".dimmed(), conversation.title.bold());
    for message in &conversation.messages {
        let label = match message.role {
            Role::User => "you ›".blue().bold(),
            Role::Assistant => "assistant ›".green().bold(),
            Role::System => "system ›".dimmed(),
        };
        println!("{} {}", label, message.content);
    }
}
