//! Walks a locked mailbox in blocks of sequence numbers and turns each
//! block into a UID window.
//!
//! Windows are strictly increasing: the next block always starts at the
//! sequence number after the previous block's end.

use crate::error::ImapError;
use crate::mail::imap::{ImapConnection, UidRange};
use crate::sync::state::SyncPlan;

#[derive(Debug, Clone)]
pub struct FetchUidRange {
    mail_count: Option<u32>,
    uid_next: Option<u32>,
    to_seq: Option<u32>,
    exhausted: bool,
    current: Option<UidRange>,
}

impl FetchUidRange {
    pub fn new(mail_count: Option<u32>, uid_next: Option<u32>) -> Self {
        Self {
            mail_count,
            uid_next,
            to_seq: None,
            exhausted: false,
            current: None,
        }
    }

    pub fn current(&self) -> Option<UidRange> {
        self.current
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// First window for `plan`. `Resume` starts at the first message with
    /// a UID above `after_uid`, every other plan at sequence 1.
    pub async fn init(
        &mut self,
        conn: &mut dyn ImapConnection,
        plan: SyncPlan,
        block_size: u32,
    ) -> Result<Option<UidRange>, ImapError> {
        let from_seq = match plan {
            SyncPlan::Resume { after_uid } => {
                if after_uid == u32::MAX {
                    return Ok(self.finish());
                }
                match conn.first_message_from_uid(after_uid + 1).await? {
                    Some(position) => position.seq,
                    None => return Ok(self.finish()),
                }
            }
            SyncPlan::Full | SyncPlan::Changes { .. } => 1,
        };
        self.update(conn, from_seq, block_size).await
    }

    /// Window following the current one, sized by the current block size.
    pub async fn advance(
        &mut self,
        conn: &mut dyn ImapConnection,
        block_size: u32,
    ) -> Result<Option<UidRange>, ImapError> {
        if self.exhausted {
            return Ok(self.finish());
        }
        let from_seq = match self.to_seq {
            Some(to_seq) => to_seq.saturating_add(1),
            None => 1,
        };
        self.update(conn, from_seq, block_size).await
    }

    async fn update(
        &mut self,
        conn: &mut dyn ImapConnection,
        from_seq: u32,
        block_size: u32,
    ) -> Result<Option<UidRange>, ImapError> {
        let from_seq = from_seq.max(1);
        if let Some(count) = self.mail_count
            && from_seq > count
        {
            return Ok(self.finish());
        }

        let Some(from) = conn.message_at(from_seq).await? else {
            return Ok(self.finish());
        };
        if let Some(uid_next) = self.uid_next
            && from.uid >= uid_next
        {
            return Ok(self.finish());
        }

        let range = match self.mail_count {
            Some(count) => {
                let to_seq = from.seq.saturating_add(block_size.max(1) - 1).min(count);
                match conn.message_at(to_seq).await? {
                    Some(to) => {
                        self.to_seq = Some(to.seq);
                        UidRange::new(from.uid, to.uid)
                    }
                    None => {
                        // Mailbox shrank since STATUS; take the rest in one go
                        self.exhausted = true;
                        self.to_seq = Some(to_seq);
                        UidRange::new(from.uid, u32::MAX)
                    }
                }
            }
            None => {
                self.exhausted = true;
                self.to_seq = Some(u32::MAX);
                UidRange::new(from.uid, u32::MAX)
            }
        };

        self.current = Some(range);
        Ok(Some(range))
    }

    fn finish(&mut self) -> Option<UidRange> {
        self.exhausted = true;
        self.current = None;
        None
    }
}
