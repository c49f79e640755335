//! Bad-block error handler
//!
//! [`Ehandler`] is the reference [`IoErrorHandler`]: multi-block failures
//! are retried one block at a time, single-block failures are reported and
//! the [`Prompter`] decides whether to ignore them (and, for reads, whether
//! to rewrite the block).
//!
//! The operation label in reports comes from [`operation_scope`], which is
//! per thread so that parallel workers each report their own activity.

use crate::error::{Ext2Error, Result};
use crate::io::{IoChannel, IoErrorContext, IoErrorHandler};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

thread_local! {
    static OPERATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Restores the previous operation label when dropped
#[must_use = "the label is cleared as soon as the guard is dropped"]
pub struct OperationGuard {
    previous: Option<String>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        OPERATION.with(|op| *op.borrow_mut() = previous);
    }
}

/// Label this thread's I/O with `label` until the guard is dropped.
pub fn operation_scope(label: impl Into<String>) -> OperationGuard {
    let previous = OPERATION.with(|op| op.borrow_mut().replace(label.into()));
    OperationGuard { previous }
}

/// Label set by the innermost live [`operation_scope`] on this thread
pub fn current_operation() -> Option<String> {
    OPERATION.with(|op| op.borrow().clone())
}

/// Answers the handler's yes/no questions
pub trait Prompter: Send + Sync {
    fn ask(&self, question: &str, default: bool) -> bool;
}

/// Non-interactive prompter answering every question the same way
#[derive(Debug, Default)]
pub struct AutoPrompter {
    answer: Option<bool>,
    asked: Mutex<Vec<String>>,
}

impl AutoPrompter {
    /// Always answer `answer`.
    pub fn answering(answer: bool) -> Self {
        AutoPrompter {
            answer: Some(answer),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Take each question's default.
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Questions asked so far
    pub fn questions(&self) -> Vec<String> {
        self.asked.lock().clone()
    }
}

impl Prompter for AutoPrompter {
    fn ask(&self, question: &str, default: bool) -> bool {
        let answer = self.answer.unwrap_or(default);
        debug!("{}? {}", question, if answer { "yes" } else { "no" });
        self.asked.lock().push(question.to_string());
        answer
    }
}

/// Handler behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EhandlerPolicy {
    /// Install the handler on the channel of every newly initialized handle
    pub install: bool,
    /// Non-interactive repair: any unrecoverable block aborts the run
    pub preen: bool,
    /// Fixed answer for prompts; `None` takes each prompt's default
    pub answer: Option<bool>,
}

/// Reference bad-block handler
pub struct Ehandler {
    /// Blocks at or past this are never rewritten
    fs_blocks: u64,
    preen: bool,
    exiting: Arc<AtomicBool>,
    prompter: Arc<dyn Prompter>,
    reports: Mutex<Vec<String>>,
}

impl std::fmt::Debug for Ehandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ehandler")
            .field("fs_blocks", &self.fs_blocks)
            .field("preen", &self.preen)
            .field("exiting", &self.is_exiting())
            .finish()
    }
}

impl Ehandler {
    pub fn new(fs_blocks: u64, prompter: Arc<dyn Prompter>) -> Self {
        Ehandler {
            fs_blocks,
            preen: false,
            exiting: Arc::new(AtomicBool::new(false)),
            prompter,
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn with_policy(fs_blocks: u64, policy: &EhandlerPolicy) -> Self {
        let prompter = AutoPrompter {
            answer: policy.answer,
            asked: Mutex::new(Vec::new()),
        };
        let mut handler = Self::new(fs_blocks, Arc::new(prompter));
        handler.preen = policy.preen;
        handler
    }

    pub fn preen(mut self, preen: bool) -> Self {
        self.preen = preen;
        self
    }

    /// Install fresh read and write callbacks on `channel`.
    pub fn install(self, channel: &IoChannel) -> Arc<Ehandler> {
        let handler = Arc::new(self);
        channel.set_error_handler(Some(handler.clone()));
        handler
    }

    /// Flag shared with whoever drives shutdown; once set every error is ignored.
    pub fn exiting_flag(&self) -> Arc<AtomicBool> {
        self.exiting.clone()
    }

    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Messages reported so far
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().clone()
    }

    fn report(&self, verb: &str, ctx: &IoErrorContext, error: &io::Error) {
        let msg = match &ctx.operation {
            Some(op) => format!("Error {} block {} ({}) while {}.", verb, ctx.block, error, op),
            None => format!("Error {} block {} ({}).", verb, ctx.block, error),
        };
        warn!("{}", msg);
        self.reports.lock().push(msg);
    }

    /// In preen mode an unrecoverable block stops the run.
    fn preen_halt(&self, error: io::Error) -> Result<()> {
        self.set_exiting();
        warn!("unexpected inconsistency, run the checker manually");
        Err(Ext2Error::Io(error))
    }
}

impl IoErrorHandler for Ehandler {
    fn on_read_error(
        &self,
        channel: &IoChannel,
        ctx: &IoErrorContext,
        buf: &mut [u8],
        error: io::Error,
    ) -> Result<()> {
        if self.is_exiting() {
            return Ok(());
        }

        if ctx.count > 1 {
            let bs = channel.block_size() as usize;
            for (i, chunk) in buf.chunks_mut(bs).take(ctx.count).enumerate() {
                channel.read_blk(ctx.block + i as u64, 1, chunk)?;
            }
            return Ok(());
        }

        self.report("reading", ctx, &error);
        if self.preen {
            return self.preen_halt(error);
        }

        if ctx.block >= self.fs_blocks {
            return Ok(());
        }

        if self.prompter.ask("Ignore error", true) {
            if self.prompter.ask("Force rewrite", true) {
                if let Err(e) = channel.write_blk(ctx.block, ctx.count, buf) {
                    debug!("rewrite of block {} failed: {}", ctx.block, e);
                }
            }
            return Ok(());
        }

        Err(Ext2Error::Io(error))
    }

    fn on_write_error(
        &self,
        channel: &IoChannel,
        ctx: &IoErrorContext,
        buf: &[u8],
        error: io::Error,
    ) -> Result<()> {
        if self.is_exiting() {
            return Ok(());
        }

        if ctx.count > 1 {
            let bs = channel.block_size() as usize;
            for (i, chunk) in buf.chunks(bs).take(ctx.count).enumerate() {
                channel.write_blk(ctx.block + i as u64, 1, chunk)?;
            }
            return Ok(());
        }

        self.report("writing", ctx, &error);
        if self.preen {
            return self.preen_halt(error);
        }

        if self.prompter.ask("Ignore error", true) {
            return Ok(());
        }

        Err(Ext2Error::Io(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_scope_nests() {
        assert_eq!(current_operation(), None);
        {
            let _outer = operation_scope("reading bitmaps");
            {
                let _inner = operation_scope("reading inode table");
                assert_eq!(current_operation().as_deref(), Some("reading inode table"));
            }
            assert_eq!(current_operation().as_deref(), Some("reading bitmaps"));
        }
        assert_eq!(current_operation(), None);
    }

    #[test]
    fn test_operation_is_per_thread() {
        let _op = operation_scope("main thread work");
        std::thread::spawn(|| assert_eq!(current_operation(), None))
            .join()
            .unwrap();
    }

    #[test]
    fn test_auto_prompter_records_questions() {
        let p = AutoPrompter::answering(false);
        assert!(!p.ask("Ignore error", true));
        let d = AutoPrompter::defaults();
        assert!(d.ask("Force rewrite", true));
        assert_eq!(p.questions(), vec!["Ignore error".to_string()]);
    }
}
