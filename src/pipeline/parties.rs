//! Member and office processors.
//!
//! Same shape as the listing processor minus children, raw archive and
//! history: visibility gate, load, upsert, media refresh on photo change.

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::mapper::{map_member, map_office};
use crate::model::ResourceKind;

use super::media_refresh::{refresh_media, MediaRefreshRequest};
use super::{PipelineDeps, ProcessFlags, RecordOutcome};

pub struct MemberProcessor {
    deps: PipelineDeps,
}

impl MemberProcessor {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn process(
        &self,
        record: &Map<String, Value>,
        flags: ProcessFlags,
    ) -> Result<RecordOutcome> {
        let mapped = map_member(record)?;
        let member = mapped.member;
        let store = &self.deps.store;

        if !member.can_view {
            if store.get_member(&member.member_key).await?.is_none() {
                return Ok(RecordOutcome::default());
            }
            store.set_member_hidden(&member.member_key, Utc::now()).await?;
            return Ok(RecordOutcome {
                deleted: 1,
                ..Default::default()
            });
        }

        let existing = store.get_member(&member.member_key).await?;
        store.upsert_member(&member).await?;

        let mut outcome = if existing.is_some() {
            RecordOutcome {
                updated: 1,
                ..Default::default()
            }
        } else {
            RecordOutcome {
                inserted: 1,
                ..Default::default()
            }
        };

        let photos_changed = match &existing {
            None => true,
            Some(old) => old.photos_change_ts != member.photos_change_ts,
        };
        if photos_changed && !mapped.media.is_empty() {
            let stats = refresh_media(
                &self.deps,
                MediaRefreshRequest {
                    resource: ResourceKind::Member,
                    parent_key: &member.member_key,
                    refetch_id: &member.member_key,
                    incoming: &mapped.media,
                    run_id: flags.run_id,
                },
            )
            .await?;
            outcome.media_queued += stats.queued;
            outcome.media_downloaded += stats.downloaded;
            outcome.media_deleted += stats.deleted;
            outcome.media_bytes += stats.bytes;
        }

        Ok(outcome)
    }
}

pub struct OfficeProcessor {
    deps: PipelineDeps,
}

impl OfficeProcessor {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn process(
        &self,
        record: &Map<String, Value>,
        flags: ProcessFlags,
    ) -> Result<RecordOutcome> {
        let mapped = map_office(record)?;
        let office = mapped.office;
        let store = &self.deps.store;

        if !office.can_view {
            if store.get_office(&office.office_key).await?.is_none() {
                return Ok(RecordOutcome::default());
            }
            store.set_office_hidden(&office.office_key, Utc::now()).await?;
            return Ok(RecordOutcome {
                deleted: 1,
                ..Default::default()
            });
        }

        let existing = store.get_office(&office.office_key).await?;
        store.upsert_office(&office).await?;

        let mut outcome = if existing.is_some() {
            RecordOutcome {
                updated: 1,
                ..Default::default()
            }
        } else {
            RecordOutcome {
                inserted: 1,
                ..Default::default()
            }
        };

        let photos_changed = match &existing {
            None => true,
            Some(old) => old.photos_change_ts != office.photos_change_ts,
        };
        if photos_changed && !mapped.media.is_empty() {
            let stats = refresh_media(
                &self.deps,
                MediaRefreshRequest {
                    resource: ResourceKind::Office,
                    parent_key: &office.office_key,
                    refetch_id: &office.office_key,
                    incoming: &mapped.media,
                    run_id: flags.run_id,
                },
            )
            .await?;
            outcome.media_queued += stats.queued;
            outcome.media_downloaded += stats.downloaded;
            outcome.media_deleted += stats.deleted;
            outcome.media_bytes += stats.bytes;
        }

        Ok(outcome)
    }
}
