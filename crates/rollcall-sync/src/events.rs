use rollcall_core::OnlineEvent;
use rollcall_storage::ResilientWriter;
use tracing::warn;

/// Appends one row per observed-online occurrence. Never deduplicates.
pub struct EventLogger {
    writer: ResilientWriter,
    sheet: String,
}

impl EventLogger {
    pub fn new(writer: ResilientWriter, sheet: impl Into<String>) -> Self {
        Self {
            writer,
            sheet: sheet.into(),
        }
    }

    /// Returns whether the row landed. A failed append is logged and the
    /// caller carries on.
    pub async fn log_online(&self, event: &OnlineEvent) -> bool {
        let landed = self
            .writer
            .append_row(&self.sheet, &event.to_row())
            .await
            .is_some();
        if !landed {
            warn!(nickname = %event.nickname, "online event not recorded");
        }
        landed
    }
}
