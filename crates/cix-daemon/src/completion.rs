//! The completion thread: a dedicated OS thread owning the live parser and
//! the translation-unit cache.
//!
//! Requests arrive over a crossbeam channel; replies go straight to the
//! requesting connection's outbound queue, so the main loop never blocks on
//! a parse.

use std::sync::Arc;
use std::thread;

use crossbeam_channel as channel;
use tokio::sync::mpsc;

use cix_cache::{TranslationUnit, TranslationUnitCache, UnitDescription, UnitState};
use cix_clang::CompletionEngine;
use cix_core::Source;
use cix_proto::Message;

pub struct CompletionRequest {
    pub source: Source,
    pub line: u32,
    pub column: u32,
    pub unsaved: Option<String>,
    /// Warm the cache only; no candidates are produced.
    pub refresh_only: bool,
    pub reply: Option<mpsc::UnboundedSender<Message>>,
}

pub struct CompletionThread {
    tx: Option<channel::Sender<CompletionRequest>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CompletionThread {
    pub fn spawn<E>(engine: E, cache_size: usize) -> Self
    where
        E: CompletionEngine,
    {
        let (tx, rx) = channel::unbounded::<CompletionRequest>();
        let handle = thread::Builder::new()
            .name("cix-completion".to_string())
            .spawn(move || run(engine, cache_size, rx))
            .expect("spawn completion thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn request(&self, request: CompletionRequest) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(request);
        }
    }

    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CompletionThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<E>(engine: E, cache_size: usize, rx: channel::Receiver<CompletionRequest>)
where
    E: CompletionEngine,
{
    let cache: TranslationUnitCache<E::Unit> = TranslationUnitCache::new(cache_size);

    while let Ok(request) = rx.recv() {
        let description = UnitDescription {
            file_id: request.source.file_id,
            compiler: request.source.compiler.clone(),
            arguments: request.source.arguments.clone(),
        };

        let unit = match cache.get(&description) {
            Some(unit) => {
                unit.wait_for_ready();
                if request.refresh_only {
                    unit.transition(UnitState::Reparsing);
                    let outcome = unit.with_unit_mut(|parsed| match parsed {
                        Some(parsed) => engine.reparse(parsed, request.unsaved.as_deref()),
                        None => Ok(()),
                    });
                    unit.transition(UnitState::Ready);
                    if let Err(err) = outcome {
                        tracing::warn!(target: "cix.completion", error = %err, "reparse failed");
                    }
                }
                unit
            }
            None => {
                let unit = TranslationUnit::new(description);
                unit.transition(UnitState::Parsing);
                match engine.parse(&request.source, request.unsaved.as_deref()) {
                    Ok(parsed) => {
                        unit.transition_with(UnitState::Ready, parsed);
                        // Only ready units enter the cache; a failed parse
                        // must never park a later waiter on `Invalid`.
                        cache.insert(Arc::clone(&unit));
                    }
                    Err(err) => {
                        tracing::warn!(target: "cix.completion", error = %err, "parse failed");
                        unit.transition(UnitState::Invalid);
                        respond(&request, &[format!("parse failed: {err}")]);
                        continue;
                    }
                }
                unit
            }
        };

        if request.refresh_only {
            respond(&request, &[]);
            continue;
        }

        unit.transition(UnitState::Completing);
        let result = unit.with_unit_mut(|parsed| match parsed {
            Some(parsed) => engine.complete(
                parsed,
                request.line,
                request.column,
                request.unsaved.as_deref(),
            ),
            None => Ok(Vec::new()),
        });
        unit.transition(UnitState::Ready);

        match result {
            Ok(candidates) => {
                let lines: Vec<String> = candidates
                    .into_iter()
                    .map(|c| format!("{} {} {}", c.text, c.signature, c.priority))
                    .collect();
                respond(&request, &lines);
            }
            Err(err) => respond(&request, &[format!("completion failed: {err}")]),
        }
    }
}

fn respond(request: &CompletionRequest, lines: &[String]) {
    let Some(reply) = &request.reply else {
        return;
    };
    for line in lines {
        let _ = reply.send(Message::Response(line.clone()));
    }
    let _ = reply.send(Message::Finish);
}
