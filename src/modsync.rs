//! Reconciles the blacklist table with a Trello moderation board.
//!
//! The board has a Whitelist and a Blacklist list; moderators move cards
//! between them. On disagreement the board wins: the table is updated and
//! the card gets a confirming comment. Table rows without a card get one,
//! cards without a row get a row.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::db::{BlacklistState, Index, index::IndexError};
use crate::metrics::Metrics;
use crate::trello::{Card, List, Trello, TrelloError};
use crate::{canonical_name, short_name};

const TOO_BIG_REASON: &str = "Too big.";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Trello(#[from] TrelloError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("board is missing the {0} list")]
    MissingList(&'static str),
}

pub struct Reconciler {
    pub index: Index,
    pub trello: Trello,
    pub board: String,
    pub interval: Duration,
    pub metrics: Metrics,
    pub cancel: CancellationToken,
}

impl Reconciler {
    pub async fn run(&self) -> Result<(), SyncError> {
        while !self.cancel.is_cancelled() {
            self.sync_once().await?;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        Ok(())
    }

    pub async fn sync_once(&self) -> Result<(), SyncError> {
        let lists = self.trello.lists(&self.board).await?;
        let whitelist = find_list(&lists, "Whitelist")?;
        let blacklist = find_list(&lists, "Blacklist")?;

        // Cards keyed by the bare owner/repo name they carry.
        let mut cards: HashMap<String, Card> = self
            .trello
            .cards(&self.board)
            .await?
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        for entry in self.index.list_blacklist().await? {
            let short = short_name(&entry.name).to_string();

            let Some(card) = cards.remove(&short) else {
                self.add_card_for(&entry.name, &entry.reason, entry.state, whitelist, blacklist)
                    .await?;
                continue;
            };

            // Card present; the list it sits in is authoritative.
            if card.id_list == whitelist.id && entry.state != BlacklistState::Whitelisted {
                tracing::info!(repo = %entry.name, "whitelisting");
                self.index
                    .set_blacklist_state(&entry.name, BlacklistState::Whitelisted)
                    .await?;
                self.trello.add_comment(&card.id, "Applied whitelist!").await?;
                self.metrics.add("moved", 1);
            }
            if card.id_list == blacklist.id && entry.state != BlacklistState::Blacklisted {
                tracing::info!(repo = %entry.name, "blacklisting");
                self.index
                    .set_blacklist_state(&entry.name, BlacklistState::Blacklisted)
                    .await?;
                self.trello.add_comment(&card.id, "Applied blacklist!").await?;
                self.metrics.add("moved", 1);
            }
        }

        // Cards moderators created directly, with no table row yet.
        for (short, card) in cards {
            let state = if card.id_list == whitelist.id {
                BlacklistState::Whitelisted
            } else if card.id_list == blacklist.id {
                BlacklistState::Blacklisted
            } else {
                continue;
            };

            let name = canonical_name(&short);
            tracing::info!(repo = %name, state = ?state, "importing board card");
            self.index.add_blacklist(&name, &card.desc).await?;
            let confirmation = if state == BlacklistState::Whitelisted {
                self.index
                    .set_blacklist_state(&name, BlacklistState::Whitelisted)
                    .await?;
                "Added to whitelist!"
            } else {
                "Added to blacklist!"
            };
            self.trello.add_comment(&card.id, confirmation).await?;
            self.metrics.add("newline", 1);
        }

        Ok(())
    }

    async fn add_card_for(
        &self,
        name: &str,
        reason: &str,
        state: BlacklistState,
        whitelist: &List,
        blacklist: &List,
    ) -> Result<(), SyncError> {
        let short = short_name(name);
        let mut desc = format!("https://github.com/{short}");
        if !reason.is_empty() && reason != TOO_BIG_REASON {
            desc.push_str("\n\n");
            desc.push_str(reason);
        }

        let list = if state == BlacklistState::Whitelisted {
            whitelist
        } else {
            blacklist
        };
        let card = self.trello.add_card(&list.id, short, &desc).await?;
        self.trello.add_label(&card.id, "green", "github.com").await?;
        if reason == TOO_BIG_REASON {
            self.trello.add_label(&card.id, "blue", "TOO BIG").await?;
        } else {
            self.trello.add_label(&card.id, "black", "BLACK").await?;
        }
        self.metrics.add("newcard", 1);
        Ok(())
    }
}

fn find_list<'a>(lists: &'a [List], name: &'static str) -> Result<&'a List, SyncError> {
    lists
        .iter()
        .find(|l| l.name == name)
        .ok_or(SyncError::MissingList(name))
}
