//! `kbchat chat`: stream answers to the terminal.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use dialoguer::Input;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kbchat_core::citation::{citation_indices, document_image_url, replace_citations};
use kbchat_core::config::Config;
use kbchat_core::types::{Reference, Role};
use kbchat_exchange::{AnswerState, Conversation, ExchangeController, ExchangeError, ExchangeOutcome};
use kbchat_upstream::{ChatBackend, ListSessionsParams};

const HELP: &str = "Commands: /regenerate, /new, /show, /quit. Ctrl-C cancels a running answer.";

pub async fn run(
    config: &Config,
    backend: Arc<dyn ChatBackend>,
    message: Option<String>,
    session_id: Option<String>,
) -> anyhow::Result<()> {
    let mut conversation = match session_id {
        Some(id) => resume(config, backend.clone(), &id).await?,
        None => Conversation::from_config(backend.clone(), config),
    };

    if let Some(question) = message {
        ask(&mut conversation, config, Some(&question)).await?;
        return Ok(());
    }

    println!("{HELP}");
    loop {
        let line = tokio::task::spawn_blocking(|| {
            Input::<String>::new()
                .with_prompt("you")
                .allow_empty(true)
                .interact_text()
        })
        .await??;

        let result = match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => {
                println!("{HELP}");
                continue;
            }
            "/new" => {
                conversation = Conversation::from_config(backend.clone(), config);
                println!("Started a new conversation");
                continue;
            }
            "/show" => {
                show_transcript(&conversation, config);
                continue;
            }
            "/regenerate" => ask(&mut conversation, config, None).await,
            question => ask(&mut conversation, config, Some(question)).await,
        };
        if let Err(e) = result {
            eprintln!("error: {e}");
            if matches!(e, ExchangeError::Transport(_) | ExchangeError::StaleStream(_)) {
                eprintln!("Use /regenerate to try again.");
            }
        }
    }

    Ok(())
}

async fn resume(
    config: &Config,
    backend: Arc<dyn ChatBackend>,
    id: &str,
) -> anyhow::Result<Conversation> {
    let params = ListSessionsParams {
        id: Some(id.to_string()),
        ..ListSessionsParams::default()
    };
    let session = backend
        .list_sessions(&params)
        .await?
        .into_iter()
        .find(|s| s.id == id)
        .with_context(|| format!("session {id} not found"))?;
    debug!(session_id = %session.id, messages = session.messages.len(), "Resuming session");
    println!("Continuing \"{}\"", session.name);
    Ok(Conversation::resume(
        ExchangeController::from_config(backend, config),
        session,
    ))
}

/// Ask `question` (or regenerate the last answer when `None`) and stream the
/// answer to stdout.
async fn ask(
    conversation: &mut Conversation,
    config: &Config,
    question: Option<&str>,
) -> Result<ExchangeOutcome, ExchangeError> {
    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let mut answers = conversation.controller().subscribe();
    let mut shown = String::new();
    let result = {
        let exchange = async {
            match question {
                Some(q) => conversation.send(q, cancel.clone()).await,
                None => conversation.regenerate(cancel.clone()).await,
            }
        };
        tokio::pin!(exchange);
        loop {
            tokio::select! {
                result = &mut exchange => break result,
                Ok(()) = answers.changed() => {
                    let snapshot = answers.borrow_and_update().clone();
                    if snapshot.streaming {
                        show_progress(&mut shown, &snapshot.text);
                    }
                }
            }
        }
    };
    ctrl_c.abort();

    match &result {
        Ok(ExchangeOutcome::Completed(answer)) => {
            show_progress(&mut shown, &answer.text);
            println!();
            print_sources(answer, config);
        }
        Ok(ExchangeOutcome::Cancelled) => println!("\n[cancelled]"),
        Err(_) if !shown.is_empty() => println!(),
        Err(_) => {}
    }
    result
}

/// Print what `text` adds to what is already on screen. Snapshots replace
/// each other, so a snapshot that rewrites earlier text is printed in full.
fn show_progress(shown: &mut String, text: &str) {
    if text == shown {
        return;
    }
    let mut out = std::io::stdout().lock();
    let written = match text.strip_prefix(shown.as_str()) {
        Some(rest) => write!(out, "{rest}"),
        None => write!(out, "\n{text}"),
    };
    if written.and_then(|()| out.flush()).is_err() {
        return;
    }
    shown.clear();
    shown.push_str(text);
}

fn print_sources(answer: &AnswerState, config: &Config) {
    let mut cited = citation_indices(&answer.text);
    cited.sort_unstable();
    cited.dedup();
    let cited: Vec<(usize, &Reference)> = cited
        .into_iter()
        .filter_map(|i| answer.references.get(i).map(|r| (i, r)))
        .collect();
    if cited.is_empty() {
        return;
    }

    println!("Sources:");
    let base_url = config.base_url();
    for (index, reference) in cited {
        match &reference.image_id {
            Some(image_id) => println!(
                "  ##{index}$$ {} ({})",
                reference.document_name,
                document_image_url(&base_url, image_id)
            ),
            None => println!("  ##{index}$$ {}", reference.document_name),
        }
    }
}

fn show_transcript(conversation: &Conversation, config: &Config) {
    if conversation.transcript().is_empty() {
        println!("No messages yet");
        return;
    }
    let base_url = config.base_url();
    for message in conversation.transcript().messages() {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        let content = replace_citations(&message.content, &message.references, |index, reference| {
            match &reference.image_id {
                Some(image_id) => format!(
                    "[{} {}]",
                    index + 1,
                    document_image_url(&base_url, image_id)
                ),
                None => format!("[{}: {}]", index + 1, reference.document_name),
            }
        });
        println!("{speaker}: {content}\n");
    }
}
