/// Outbound bridge: hand a message to the desktop messaging app
use crate::error::{MirrorError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info};

const SEND_TEXT_SCRIPT: &str = r#"
on run argv
    set targetChat to item 1 of argv
    set targetBuddy to item 2 of argv
    set theMessage to item 3 of argv
    tell application "Messages"
        if targetChat is not "" then
            send theMessage to chat id targetChat
        else
            send theMessage to buddy targetBuddy of (service 1 whose service type is iMessage)
        end if
    end tell
end run"#;

const SEND_FILE_SCRIPT: &str = r#"
on run argv
    set targetChat to item 1 of argv
    set targetBuddy to item 2 of argv
    set theFile to POSIX file (item 3 of argv)
    tell application "Messages"
        if targetChat is not "" then
            send theFile to chat id targetChat
        else
            send theFile to buddy targetBuddy of (service 1 whose service type is iMessage)
        end if
    end tell
end run"#;

/// Everything a bridge needs to deliver one send request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub conversation_id: String,
    /// Store-assigned chat guid (addresses group threads)
    pub guid: String,
    pub is_group: bool,
    pub recipients: Vec<String>,
    pub text: String,
    pub file: Option<PathBuf>,
}

/// Delivery seam. Blocking from the caller's point of view.
pub trait OutboundBridge: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// Drives Messages.app through `osascript`
pub struct OsaScriptBridge {
    program: PathBuf,
}

impl Default for OsaScriptBridge {
    fn default() -> Self {
        Self {
            program: PathBuf::from("osascript"),
        }
    }
}

impl OsaScriptBridge {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, script: &str, args: &[&str]) -> Result<()> {
        debug!("Running {} with {} args", self.program.display(), args.len());
        let output = Command::new(&self.program)
            .arg("-e")
            .arg(script)
            .args(args)
            .output()
            .map_err(|e| MirrorError::Send(format!("cannot run {}: {}", self.program.display(), e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("osascript failed ({}): {}", output.status, stderr.trim());
            Err(MirrorError::Send(format!(
                "osascript exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }

    fn targets(message: &OutboundMessage) -> (String, String) {
        if message.is_group {
            (message.guid.clone(), String::new())
        } else {
            let buddy = message
                .recipients
                .first()
                .cloned()
                .unwrap_or_else(|| message.conversation_id.clone());
            (String::new(), buddy)
        }
    }
}

impl OutboundBridge for OsaScriptBridge {
    fn send(&self, message: &OutboundMessage) -> Result<()> {
        let (chat, buddy) = Self::targets(message);

        if !message.text.is_empty() {
            self.run(SEND_TEXT_SCRIPT, &[chat.as_str(), buddy.as_str(), message.text.as_str()])?;
        }

        if let Some(file) = &message.file {
            let path = absolute_existing(file)?;
            let path = path.to_string_lossy();
            self.run(SEND_FILE_SCRIPT, &[chat.as_str(), buddy.as_str(), &*path])?;
        }

        info!("Sent to {}", message.conversation_id);
        Ok(())
    }
}

fn absolute_existing(file: &Path) -> Result<PathBuf> {
    file.canonicalize()
        .map_err(|e| MirrorError::Send(format!("file {} unavailable: {}", file.display(), e)))
}
