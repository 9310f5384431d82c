use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use rapport_core::agent::{AgentState, FileCheckpointStore};
use rapport_core::config::AgentCfg;
use rapport_core::dialogue::{Session, TurnOutcome, TurnProcessor};
use rapport_core::embedding::HashEmbedder;
use rapport_core::emotion::{EmotionClassifier, KeywordEmotionClassifier, LlmEmotionClassifier};
use rapport_core::persona::TemplateRenderer;
use rapport_core::trajectory::{FlushOutcome, InMemorySessionStore, PgSessionStore, SessionStore};
use rapport_core::types::UserProfile;
use rapport_llm::embedding::EmbeddingProvider;
use rapport_llm::provider::LlmProvider;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing: write to file when RUST_LOG is set so logs don't interleave with the prompt
    if std::env::var("RUST_LOG").is_ok() {
        let file = std::fs::File::create("/tmp/rapport.log")?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    // DATABASE_URL (optional: no DB = ephemeral sessions, default config)
    let mut startup_notice: Option<String> = None;
    let pool = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let connect_result = tokio::time::timeout(
                Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
                sqlx::postgres::PgPoolOptions::new().max_connections(8).connect(&url),
            )
            .await;

            match connect_result {
                Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
                    Ok(()) => {
                        tracing::info!("database connected and migrations applied");
                        Some(pool)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "database migration failed, falling back to ephemeral mode");
                        startup_notice = Some("note: database migration failed; sessions will not persist.".into());
                        None
                    }
                },
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "failed to connect DATABASE_URL, falling back to ephemeral mode");
                    startup_notice = Some("note: could not connect to DATABASE_URL; sessions will not persist.".into());
                    None
                }
                Err(_) => {
                    tracing::warn!(timeout_secs = DB_CONNECT_TIMEOUT_SECS, "database connect timed out");
                    startup_notice = Some(format!(
                        "note: database connect timed out ({DB_CONNECT_TIMEOUT_SECS}s); sessions will not persist."
                    ));
                    None
                }
            }
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, running in ephemeral mode");
            None
        }
    };

    let cfg = if let Some(ref pool) = pool {
        AgentCfg::load(pool).await?
    } else {
        AgentCfg::default()
    };

    let llm: Option<Arc<dyn LlmProvider>> = rapport_llm::http::from_env().map(|p| {
        tracing::info!(name = p.name(), "LLM provider initialized");
        Arc::new(p) as _
    });

    let embedder: Arc<dyn EmbeddingProvider> = match rapport_llm::embedding::from_env() {
        Some(e) => {
            if e.dim() != cfg.sentence_dim {
                anyhow::bail!(
                    "RAPPORT_EMBED_DIM is {} but agent_config.sentence_dim is {}",
                    e.dim(),
                    cfg.sentence_dim
                );
            }
            tracing::info!(name = e.name(), dim = e.dim(), "embedding provider initialized");
            Arc::new(e)
        }
        None => {
            tracing::warn!("RAPPORT_EMBED_MODEL not set; using hashed bag-of-words embeddings");
            Arc::new(HashEmbedder::new(cfg.sentence_dim))
        }
    };

    let classifier: Arc<dyn EmotionClassifier> = match &llm {
        Some(p) => Arc::new(LlmEmotionClassifier::new(p.clone())),
        None => Arc::new(KeywordEmotionClassifier),
    };

    let sessions: Arc<dyn SessionStore> = match pool {
        Some(pool) => Arc::new(PgSessionStore::new(pool)),
        None => Arc::new(InMemorySessionStore::new()),
    };

    let checkpoints = Arc::new(FileCheckpointStore::new(cfg.checkpoint_path.clone()));
    let agent = Arc::new(AgentState::initialize(cfg, checkpoints)?);

    let processor = TurnProcessor::new(
        agent,
        embedder,
        classifier,
        Arc::new(TemplateRenderer::default()),
        sessions,
        llm,
    );

    let mut user = UserProfile::new(
        std::env::var("RAPPORT_USER_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
        std::env::var("RAPPORT_USER_NAME").unwrap_or_else(|_| "friend".into()),
    );
    user.custom_persona = std::env::var("RAPPORT_CUSTOM_PERSONA").ok();

    run_repl(&processor, Session::new(user), startup_notice).await
}

async fn run_repl(
    processor: &TurnProcessor,
    mut session: Session,
    startup_notice: Option<String>,
) -> anyhow::Result<()> {
    const SPINNER: [&str; 4] = ["-", "\\", "|", "/"];

    if let Some(notice) = startup_notice {
        println!("{notice}");
    }
    println!("commands: /good  /bad  /rate <reward>  /new  /q");

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    spawn_input_thread(line_tx, ready_rx);
    request_next_prompt(&ready_tx);

    while let Some(event) = line_rx.recv().await {
        let line = match event {
            InputEvent::Line(line) => line,
            InputEvent::Interrupted | InputEvent::Eof => break,
            InputEvent::Error(err) => {
                eprintln!("input error: {err}");
                break;
            }
        };
        let text = line.trim();
        if text.is_empty() {
            request_next_prompt(&ready_tx);
            continue;
        }
        if matches!(text, "/q" | "/exit" | "/quit") {
            break;
        }

        if text == "/new" {
            match processor.end_session(session.id).await {
                Ok(()) => {
                    session = Session::new(session.user.clone());
                    println!("started a new session");
                }
                Err(e) => println!("could not end session: {e}"),
            }
            request_next_prompt(&ready_tx);
            continue;
        }

        if let Some(reward) = parse_feedback(text) {
            match reward {
                Ok(reward) => match processor.record_feedback(session.id, reward).await {
                    Ok(outcome) => println!("{}", describe_flush(&outcome)),
                    Err(e) => println!("feedback not recorded: {e}"),
                },
                Err(msg) => println!("{msg}"),
            }
            request_next_prompt(&ready_tx);
            continue;
        }

        let turn = processor.process_turn(&mut session, text, false);
        tokio::pin!(turn);
        let mut spinner_idx = 0usize;
        let mut spinner = tokio::time::interval(Duration::from_millis(100));
        spinner.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let result = loop {
            tokio::select! {
                result = &mut turn => break result,
                _ = spinner.tick() => {
                    draw_thinking_frame(SPINNER[spinner_idx])?;
                    spinner_idx = (spinner_idx + 1) % SPINNER.len();
                }
            }
        };
        clear_current_line()?;

        match result {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => println!("turn failed: {e}"),
        }
        request_next_prompt(&ready_tx);
    }
    drop(ready_tx);
    println!();
    Ok(())
}

/// `/good`, `/bad` or `/rate <x>`; `None` for ordinary chat text.
fn parse_feedback(text: &str) -> Option<Result<f32, String>> {
    match text {
        "/good" => Some(Ok(1.0)),
        "/bad" => Some(Ok(-1.0)),
        _ => {
            let rest = text.strip_prefix("/rate")?;
            Some(
                rest.trim()
                    .parse::<f32>()
                    .map_err(|_| format!("usage: /rate <number>, got {:?}", rest.trim())),
            )
        }
    }
}

fn print_outcome(outcome: &TurnOutcome) {
    println!("Bot> {}", outcome.reply);
    let contexts: Vec<&str> = outcome.context_sources.iter().map(|c| c.as_str()).collect();
    println!(
        "     [{} | contexts: {} | confidence {:.2} | affinity {:.0}]",
        outcome.persona_name,
        if contexts.is_empty() { "-".to_string() } else { contexts.join(", ") },
        outcome.confidence,
        outcome.affinity,
    );
    if let FlushOutcome::Learned { .. } | FlushOutcome::Dropped { .. } = outcome.flush {
        println!("     {}", describe_flush(&outcome.flush));
    }
}

fn describe_flush(outcome: &FlushOutcome) -> String {
    match outcome {
        FlushOutcome::Pending { len } => format!("{len} turn(s) buffered"),
        FlushOutcome::Learned { reason, report } => format!(
            "policy updated ({}, {} steps, loss {:.4})",
            reason.as_str(),
            report.steps,
            report.final_loss
        ),
        FlushOutcome::Dropped { reason, error } => {
            format!("policy update skipped ({}): {error}", reason.as_str())
        }
    }
}

fn draw_thinking_frame(frame: &str) -> anyhow::Result<()> {
    print!("\rthinking... {frame}");
    io::stdout().flush()?;
    Ok(())
}

fn clear_current_line() -> anyhow::Result<()> {
    print!("\r\x1b[2K");
    io::stdout().flush()?;
    Ok(())
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(
    line_tx: mpsc::UnboundedSender<InputEvent>,
    ready_rx: std::sync::mpsc::Receiver<()>,
) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline("You> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}
