//! Poll creation, voting and closing

use std::sync::Arc;

use revroom_shared::{NewPoll, Poll, PollId, RoomId, MAX_POLL_OPTIONS, MIN_POLL_OPTIONS};
use serde::Serialize;

use super::Services;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::websocket::{Fanout, PollData, ServerEvent};

/// Poll plus per-option share of the vote
#[derive(Debug, Clone, Serialize)]
pub struct PollResults {
    pub poll: Poll,
    pub options: Vec<OptionResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionResult {
    pub text: String,
    pub votes: i64,
    /// Rounded to one decimal place
    pub percentage: f64,
}

impl PollResults {
    pub fn from_poll(poll: Poll) -> Self {
        let total = poll.total_votes;
        let options = poll
            .options
            .iter()
            .map(|o| OptionResult {
                text: o.text.clone(),
                votes: o.vote_count,
                percentage: if total > 0 {
                    (o.vote_count as f64 * 1000.0 / total as f64).round() / 10.0
                } else {
                    0.0
                },
            })
            .collect();
        Self { poll, options }
    }
}

#[derive(Clone)]
pub struct PollHandler {
    svc: Arc<Services>,
}

impl PollHandler {
    pub fn new(svc: Arc<Services>) -> Self {
        Self { svc }
    }

    /// Create a poll and its announcement, broadcast both and arm the
    /// expiry timer when a duration was given.
    pub async fn create(&self, actor: &AuthUser, room_id: RoomId, data: PollData) -> ApiResult<Poll> {
        if data.question.trim().is_empty() {
            return Err(ApiError::Validation("Poll question is required".into()));
        }
        if !(MIN_POLL_OPTIONS..=MAX_POLL_OPTIONS).contains(&data.options.len()) {
            return Err(ApiError::Validation(format!(
                "A poll needs between {MIN_POLL_OPTIONS} and {MAX_POLL_OPTIONS} options"
            )));
        }
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;

        let committed = self
            .svc
            .polls
            .create_poll(NewPoll {
                room_id,
                created_by: actor.user_id,
                creator_name: actor.display_name.clone(),
                question: data.question,
                options: data.options,
                duration_minutes: data.duration,
                allow_multiple_votes: data.allow_multiple_votes,
            })
            .await?;
        let (poll, announcement) = committed.value;

        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![
                    Fanout::all(ServerEvent::PollCreated {
                        room_id,
                        poll: poll.clone(),
                    }),
                    Fanout::all(ServerEvent::NewMessage {
                        room_id,
                        message: announcement,
                    }),
                ],
            )
            .await;

        if let Some(expires_at) = poll.expires_at {
            self.svc.scheduler.schedule(poll.id, expires_at);
        }

        tracing::info!(
            poll_id = %poll.id,
            room_id = %room_id,
            options = poll.options.len(),
            expires_at = ?poll.expires_at,
            "Poll created"
        );
        Ok(poll)
    }

    pub async fn vote(&self, actor: &AuthUser, poll_id: PollId, option_index: i64) -> ApiResult<Poll> {
        let index = usize::try_from(option_index)
            .map_err(|_| ApiError::InvalidArgument("Option index must not be negative".into()))?;

        let room_id = self.svc.polls.get_poll(poll_id).await?.room_id;
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;

        let committed = self.svc.polls.cast_vote(poll_id, index, actor.user_id).await?;
        let poll = committed.value;
        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::PollVote {
                    room_id,
                    poll_id,
                    option_index: index,
                    voter_id: actor.user_id,
                    tally: poll.tally(),
                    total_votes: poll.total_votes,
                })],
            )
            .await;
        Ok(poll)
    }

    /// Creator-only close. Closing a closed poll returns it unchanged and
    /// broadcasts nothing.
    pub async fn close(&self, actor: &AuthUser, poll_id: PollId) -> ApiResult<Poll> {
        let poll = self.svc.polls.get_poll(poll_id).await?;
        if poll.created_by != actor.user_id {
            return Err(ApiError::Forbidden(
                "Only the poll creator can close it".into(),
            ));
        }
        let room_id = poll.room_id;
        self.svc.prime_outbox(room_id).await?;

        let committed = self.svc.polls.close_poll(poll_id).await?;
        let closed = committed.value;
        let batch = if closed.transitioned {
            vec![Fanout::all(ServerEvent::PollClosed {
                room_id,
                poll: closed.poll.clone(),
            })]
        } else {
            Vec::new()
        };
        self.svc.presence.publish(room_id, committed.seq, batch).await;

        if closed.transitioned {
            self.svc.scheduler.cancel(poll_id);
            tracing::info!(poll_id = %poll_id, room_id = %room_id, "Poll closed");
        }
        Ok(closed.poll)
    }

    pub async fn active_in_room(&self, room_id: RoomId) -> ApiResult<Vec<Poll>> {
        self.svc.rooms.get_room(room_id).await?;
        Ok(self.svc.polls.get_active_polls(room_id).await?)
    }

    pub async fn results(&self, poll_id: PollId) -> ApiResult<PollResults> {
        let poll = self.svc.polls.get_poll(poll_id).await?;
        Ok(PollResults::from_poll(poll))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revroom_shared::{PollOption, UserId};
    use time::OffsetDateTime;

    fn poll_with_votes(votes: &[i64]) -> Poll {
        Poll {
            id: PollId::new(),
            room_id: RoomId::new(),
            message_id: None,
            question: "Which?".into(),
            options: votes
                .iter()
                .enumerate()
                .map(|(i, v)| PollOption {
                    text: format!("Option {i}"),
                    vote_count: *v,
                    voters: Vec::new(),
                })
                .collect(),
            created_by: UserId::new(),
            created_at: OffsetDateTime::now_utc(),
            expires_at: None,
            is_active: true,
            allow_multiple_votes: false,
            total_votes: votes.iter().sum(),
        }
    }

    #[test]
    fn test_results_percentages() {
        let results = PollResults::from_poll(poll_with_votes(&[2, 1]));
        assert_eq!(results.options[0].percentage, 66.7);
        assert_eq!(results.options[1].percentage, 33.3);
    }

    #[test]
    fn test_results_without_votes() {
        let results = PollResults::from_poll(poll_with_votes(&[0, 0, 0]));
        assert!(results.options.iter().all(|o| o.percentage == 0.0));
    }
}
