//! FIFO matchmaking over the store-backed queue.
//!
//! The matchmaker is an actor: enqueues are idempotent (a re-enqueued
//! user keeps their position), a disconnect removes the entry, and every
//! enqueue attempts a match. Matching atomically pops the two queue heads
//! (the store re-pushes a lone head), assigns white to the head, and asks
//! the session hub to create the room. Remaining waiters get fresh
//! `queued{position}` updates on the queue channel.

use crate::clock::wall_now_ms;
use crate::protocol::{PlayerInfo, ServerFrame, TimeControl};
use crate::room::SessionText;
use crate::store::{BusEnvelope, QueueEntry, SharedStore};
use actix::prelude::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Ask the hub to spin up a room for a matched (or solo) pair.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct CreateRoom {
    pub game_id: Uuid,
    pub white: PlayerInfo,
    pub black: PlayerInfo,
    pub time_control: Option<TimeControl>,
    pub is_solo: bool,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Enqueue {
    pub user_id: Uuid,
    pub username: String,
    pub time_control: Option<TimeControl>,
    pub reply: Recipient<SessionText>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Dequeue {
    pub user_id: Uuid,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct TryMatch;

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct Matchmaker {
    store: SharedStore,
    room_factory: Recipient<CreateRoom>,
}

impl Matchmaker {
    pub fn new(store: SharedStore, room_factory: Recipient<CreateRoom>) -> Self {
        Self {
            store,
            room_factory,
        }
    }

    /// Pairs waiting players until fewer than two remain.
    fn try_match(&self) {
        loop {
            let pair = match self.store.queue_pop_pair() {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    log::error!("matchmaker: queue pop failed: {}", e);
                    return;
                }
            };
            let (head, second) = pair;
            let game_id = Uuid::new_v4();
            let time_control = head
                .time_control
                .or(second.time_control)
                .unwrap_or_else(TimeControl::default_pool);

            log::info!(
                "matched {} (white) vs {} (black) into game {}",
                head.username,
                second.username,
                game_id
            );

            self.room_factory.do_send(CreateRoom {
                game_id,
                white: PlayerInfo {
                    id: head.user_id,
                    username: head.username,
                },
                black: PlayerInfo {
                    id: second.user_id,
                    username: second.username,
                },
                time_control: Some(time_control),
                is_solo: false,
            });

            self.publish_positions();
        }
    }

    /// Sends every remaining waiter their current position.
    fn publish_positions(&self) {
        let entries = match self.store.queue_entries() {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("matchmaker: queue read failed: {}", e);
                return;
            }
        };
        for (index, entry) in entries.iter().enumerate() {
            let frame = ServerFrame::Queued {
                position: index + 1,
            };
            let _ = self
                .store
                .publish_queue(BusEnvelope::direct(entry.user_id, frame.to_json()));
        }
    }
}

impl Actor for Matchmaker {
    type Context = Context<Self>;
}

impl Handler<Enqueue> for Matchmaker {
    type Result = ();

    fn handle(&mut self, msg: Enqueue, _ctx: &mut Context<Self>) {
        let position = match self.store.queue_push(QueueEntry {
            user_id: msg.user_id,
            username: msg.username.clone(),
            joined_at_ms: wall_now_ms(),
            time_control: msg.time_control,
        }) {
            Ok(position) => position,
            Err(e) => {
                log::error!("matchmaker: enqueue failed: {}", e);
                msg.reply.do_send(SessionText(
                    crate::protocol::ClientError::StoreUnavailable
                        .to_frame()
                        .to_json(),
                ));
                return;
            }
        };
        log::debug!("{} queued at position {}", msg.username, position);
        msg.reply
            .do_send(SessionText(ServerFrame::Queued { position }.to_json()));
        self.try_match();
    }
}

impl Handler<Dequeue> for Matchmaker {
    type Result = ();

    fn handle(&mut self, msg: Dequeue, _ctx: &mut Context<Self>) {
        match self.store.queue_remove(msg.user_id) {
            Ok(true) => self.publish_positions(),
            Ok(false) => {}
            Err(e) => log::error!("matchmaker: dequeue failed: {}", e),
        }
    }
}

impl Handler<TryMatch> for Matchmaker {
    type Result = ();

    fn handle(&mut self, _msg: TryMatch, _ctx: &mut Context<Self>) {
        self.try_match();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HotStore;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct StubFactory {
        rooms: Arc<Mutex<Vec<CreateRoom>>>,
    }

    impl Actor for StubFactory {
        type Context = Context<Self>;
    }

    impl Handler<CreateRoom> for StubFactory {
        type Result = ();
        fn handle(&mut self, msg: CreateRoom, _ctx: &mut Context<Self>) {
            self.rooms.lock().unwrap().push(msg);
        }
    }

    struct Sink;

    impl Actor for Sink {
        type Context = Context<Self>;
    }

    impl Handler<SessionText> for Sink {
        type Result = ();
        fn handle(&mut self, _msg: SessionText, _ctx: &mut Context<Self>) {}
    }

    #[actix_rt::test]
    async fn test_fifo_pairing_head_takes_white() {
        let store = HotStore::new();
        let rooms = Arc::new(Mutex::new(Vec::new()));
        let factory = StubFactory {
            rooms: rooms.clone(),
        }
        .start();
        let sink = Sink.start();
        let matchmaker = Matchmaker::new(store.clone(), factory.recipient()).start();

        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for (user_id, name) in [(u1, "u1"), (u2, "u2"), (u3, "u3")] {
            matchmaker
                .send(Enqueue {
                    user_id,
                    username: name.to_string(),
                    time_control: None,
                    reply: sink.clone().recipient(),
                })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let created = rooms.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].white.id, u1);
        assert_eq!(created[0].black.id, u2);
        assert!(!created[0].is_solo);
        // Default pool control applies when neither player asked.
        assert_eq!(
            created[0].time_control,
            Some(TimeControl::default_pool())
        );

        // The third user waits at the head.
        assert_eq!(store.queue_position(u3).unwrap(), Some(1));
        drop(created);

        // Their disconnect drains the queue without a match.
        matchmaker.send(Dequeue { user_id: u3 }).await.unwrap();
        assert_eq!(store.queue_len().unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rooms.lock().unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn test_enqueue_is_idempotent() {
        let store = HotStore::new();
        let factory = StubFactory {
            rooms: Arc::new(Mutex::new(Vec::new())),
        }
        .start();
        let sink = Sink.start();
        let matchmaker = Matchmaker::new(store.clone(), factory.recipient()).start();

        let user = Uuid::new_v4();
        for _ in 0..2 {
            matchmaker
                .send(Enqueue {
                    user_id: user,
                    username: "solo-queuer".into(),
                    time_control: None,
                    reply: sink.clone().recipient(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.queue_len().unwrap(), 1);
        assert_eq!(store.queue_position(user).unwrap(), Some(1));
    }

    #[actix_rt::test]
    async fn test_requested_time_control_wins_over_default() {
        let store = HotStore::new();
        let rooms = Arc::new(Mutex::new(Vec::new()));
        let factory = StubFactory {
            rooms: rooms.clone(),
        }
        .start();
        let sink = Sink.start();
        let matchmaker = Matchmaker::new(store.clone(), factory.recipient()).start();

        let control = TimeControl {
            initial_sec: 60,
            increment_sec: 2,
        };
        matchmaker
            .send(Enqueue {
                user_id: Uuid::new_v4(),
                username: "bullet".into(),
                time_control: Some(control),
                reply: sink.clone().recipient(),
            })
            .await
            .unwrap();
        matchmaker
            .send(Enqueue {
                user_id: Uuid::new_v4(),
                username: "any".into(),
                time_control: None,
                reply: sink.clone().recipient(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let created = rooms.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].time_control, Some(control));
    }
}
