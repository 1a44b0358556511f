//! Edit commands: `comment`, `rename` and `delete`.
//!
//! Pending edits live in the client's memory, so each command pulls,
//! reports and pushes inside one invocation.

use crate::cmd::push::write_push;
use crate::cmd::{open_client, parse_kind};
use crate::output::{OutputMode, render};
use anyhow::Result;
use bsync_core::artifact::{Addr, AnyArtifact, ArtifactKind, Comment, FunctionHeader};
use bsync_core::{Scope, SyncClient};
use clap::Args;
use std::path::Path;
use tracing::info;

#[derive(Args, Debug)]
pub struct CommentArgs {
    /// Address the comment is attached to.
    pub addr: Addr,

    /// Comment text.
    pub text: String,

    /// Attach to the decompiled view instead of the disassembly.
    #[arg(long)]
    pub decompiled: bool,
}

#[derive(Args, Debug)]
pub struct RenameArgs {
    /// Function address.
    pub addr: Addr,

    /// New function name.
    pub name: String,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Artifact kind (function, stack_var, struct, enum, global, comment, patch).
    #[arg(value_parser = parse_kind)]
    pub kind: ArtifactKind,

    /// Rendered key of the artifact to delete.
    pub key: String,
}

fn report_and_push(
    workspace: &Path,
    mode: OutputMode,
    report: impl FnOnce(&SyncClient) -> Result<()>,
) -> Result<()> {
    let client = open_client(workspace)?;
    client.pull(&Scope::All)?;
    report(&client)?;
    let pushed = client.push()?;
    render(mode, &pushed, |r, w| write_push(r, w))
}

/// Execute `bsync comment`.
///
/// # Errors
///
/// Config, lock or store failures; `PushFailed` after repeated conflicts.
pub fn run_comment(args: &CommentArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    report_and_push(workspace, mode, |client| {
        let mut comment = Comment::new(args.addr, args.text.clone());
        if args.decompiled {
            comment = comment.decompiled();
        }
        client.report_edit(comment.into())?;
        Ok(())
    })
}

/// Execute `bsync rename`.
///
/// The rest of the header (signature, size) is taken from the merged view
/// so only the name changes.
///
/// # Errors
///
/// Config, lock or store failures; `PushFailed` after repeated conflicts.
pub fn run_rename(args: &RenameArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    report_and_push(workspace, mode, |client| {
        let current = client
            .last_view()
            .and_then(|view| view.get::<FunctionHeader>(&args.addr).cloned());
        let mut header = current.unwrap_or_else(|| FunctionHeader::new(args.addr, ""));
        info!(addr = %args.addr, from = %header.name, to = %args.name, "rename");
        header.name.clone_from(&args.name);
        client.report_edit(AnyArtifact::from(header))?;
        Ok(())
    })
}

/// Execute `bsync delete`.
///
/// # Errors
///
/// `InvalidKey` for a malformed key or a member kind; config, lock or
/// store failures.
pub fn run_delete(args: &DeleteArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    report_and_push(workspace, mode, |client| {
        client.report_delete(args.kind, &args.key)?;
        Ok(())
    })
}
