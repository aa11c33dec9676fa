//! Race Coordinator
//!
//! The connection-facing orchestrator. Owns the matchmaking queue and
//! the live room registry for the process lifetime, accepts client
//! events, drives room transitions on timers (matchmaking passes,
//! countdown ticks, bot typist steps, disconnect grace), and fans out
//! broadcasts to room members.
//!
//! All background work is keyed by room code and aborted synchronously
//! with room teardown, so no timer can fire against a finalized room.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::content::ContentSource;
use crate::core::rng::{derive_bot_seed, DeterministicRng};
use crate::network::protocol::{MatchmakingStatus, ServerMessage};
use crate::race::bot::{random_bot_difficulty, random_bot_identity, BotTypist};
use crate::race::model::{Participant, Race, RaceMode, RaceStatus, UserId, UserIdentity};
use crate::race::queue::{MatchmakingQueue, QueueEntry, QueueError};
use crate::race::room::{generate_room_code, RaceRoom, RoomError, RoomRegistry};
use crate::store::{RaceStore, StoreError};

/// Bots added to a timed-out lone player, lower bound.
const BOT_FILL_MIN: i32 = 1;
/// Bots added to a timed-out lone player, upper bound.
const BOT_FILL_MAX: i32 = 3;

/// Coordinator errors surfaced to the issuing client.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// No live or stored room under that code.
    #[error("Race room not found")]
    RoomNotFound,

    /// Room-level rejection.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Queue-level rejection.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A required field was missing or empty.
    #[error("{0}")]
    Validation(String),

    /// The persistence store failed a foreground write.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// Timing and sizing knobs. Tests shorten the durations.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Room capacity.
    pub max_participants: usize,
    /// Countdown ticks broadcast before a race starts.
    pub countdown_seconds: u32,
    /// Matchmaking pass cadence.
    pub matchmaking_interval: Duration,
    /// Queue wait before a lone player is bot-filled.
    pub matchmaking_timeout: Duration,
    /// Largest group taken from the queue at once.
    pub max_group_size: usize,
    /// How long a disconnected participant may stall a running race
    /// before being treated as finished.
    pub disconnect_grace: Duration,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            max_participants: crate::MAX_RACE_PARTICIPANTS,
            countdown_seconds: crate::COUNTDOWN_SECONDS as u32,
            matchmaking_interval: Duration::from_secs(1),
            matchmaking_timeout: Duration::from_secs(10),
            max_group_size: 5,
            disconnect_grace: Duration::from_secs(30),
        }
    }
}

/// The race coordination engine.
pub struct RaceCoordinator {
    config: RaceConfig,
    rooms: RoomRegistry,
    queue: Mutex<MatchmakingQueue>,
    store: Arc<dyn RaceStore>,
    content: Arc<dyn ContentSource>,
    /// Background tasks (countdown, bot typists, grace timers) keyed
    /// by room code; aborted on teardown.
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    /// In-flight fire-and-forget document writes, keyed by room code.
    /// Aborted before the finalize write so a stale mirror can never
    /// land on top of final standings.
    persist_tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    rng: Mutex<DeterministicRng>,
}

impl RaceCoordinator {
    /// Construct the process-wide coordinator.
    pub fn new(
        config: RaceConfig,
        store: Arc<dyn RaceStore>,
        content: Arc<dyn ContentSource>,
    ) -> Arc<Self> {
        let seed = u64::from_le_bytes(Uuid::new_v4().as_bytes()[..8].try_into().unwrap_or([0; 8]));
        Arc::new(Self {
            config,
            rooms: RoomRegistry::new(),
            queue: Mutex::new(MatchmakingQueue::new()),
            store,
            content,
            tasks: Mutex::new(HashMap::new()),
            persist_tasks: Mutex::new(HashMap::new()),
            rng: Mutex::new(DeterministicRng::new(seed)),
        })
    }

    /// Number of waiting queue entries.
    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.count().await
    }

    // =========================================================================
    // MATCHMAKING
    // =========================================================================

    /// Spawn the periodic matchmaking pass (grouping + expiry).
    pub fn spawn_matchmaking_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(coordinator.config.matchmaking_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                coordinator.run_matchmaking_pass().await;
            }
        })
    }

    /// Enqueue a player and immediately attempt to group.
    pub async fn find_race(
        self: &Arc<Self>,
        identity: UserIdentity,
        mode: RaceMode,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), CoordinatorError> {
        let group = {
            let mut queue = self.queue.lock().await;
            queue.enqueue(identity, mode, sender.clone())?;
            queue.take_group(mode, self.config.max_group_size)
        };

        let _ = sender
            .send(ServerMessage::MatchmakingStatus {
                status: MatchmakingStatus::Searching,
            })
            .await;

        if let Some(group) = group {
            self.create_matchmade_room(mode, group).await;
        }
        Ok(())
    }

    /// Remove a player's queue entry and confirm the cancellation.
    pub async fn cancel_matchmaking(&self, user_id: &UserId, sender: &mpsc::Sender<ServerMessage>) {
        self.queue.lock().await.cancel(user_id);
        let _ = sender
            .send(ServerMessage::MatchmakingStatus {
                status: MatchmakingStatus::Cancelled,
            })
            .await;
    }

    /// Drop a disconnected player's queue entry without notification.
    pub async fn drop_queue_entry(&self, user_id: &UserId) {
        self.queue.lock().await.cancel(user_id);
    }

    /// One grouping-and-expiry pass over the queue.
    async fn run_matchmaking_pass(self: &Arc<Self>) {
        let (groups, expired) = {
            let mut queue = self.queue.lock().await;
            let mut groups = Vec::new();
            for mode in [RaceMode::Normal, RaceMode::Code] {
                while let Some(group) = queue.take_group(mode, self.config.max_group_size) {
                    groups.push((mode, group));
                }
            }
            let expired = queue.take_expired(self.config.matchmaking_timeout);
            (groups, expired)
        };

        for (mode, group) in groups {
            self.create_matchmade_room(mode, group).await;
        }
        for entry in expired {
            self.create_botfill_room(entry).await;
        }
    }

    /// Build a room from grouped queue entries and start its countdown.
    async fn create_matchmade_room(self: &Arc<Self>, mode: RaceMode, group: Vec<QueueEntry>) {
        let language = matchmade_language(mode);
        let text = match self.content.race_text(mode, language).await {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to fetch race content for matchmade room");
                for entry in &group {
                    let _ = entry
                        .sender
                        .send(ServerMessage::RaceError {
                            message: "Unable to prepare race content".into(),
                        })
                        .await;
                }
                return;
            }
        };

        let room_code = match self.allocate_room_code().await {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "room code allocation hit store error");
                generate_room_code()
            }
        };

        // The earliest-queued player hosts
        let host = &group[0].identity;
        let mut race = Race::new(&room_code, host, mode, language, text);
        for entry in &group[1..] {
            race.participants.push(Participant::human(&entry.identity));
        }

        let target = race.participants.len();
        let mut room = RaceRoom::with_target(race, self.config.max_participants, target);
        for entry in &group {
            room.subscribe(entry.identity.id, entry.sender.clone());
        }

        info!(room = %room_code, players = group.len(), ?mode, "matchmade race assembled");
        self.launch_room(room).await;
    }

    /// Build a room for a timed-out lone player, filled with bots.
    async fn create_botfill_room(self: &Arc<Self>, entry: QueueEntry) {
        let language = matchmade_language(entry.mode);
        let text = match self.content.race_text(entry.mode, language).await {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to fetch race content for bot-fill room");
                let _ = entry
                    .sender
                    .send(ServerMessage::RaceError {
                        message: "Unable to prepare race content".into(),
                    })
                    .await;
                return;
            }
        };

        let room_code = match self.allocate_room_code().await {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "room code allocation hit store error");
                generate_room_code()
            }
        };

        let mut race = Race::new(&room_code, &entry.identity, entry.mode, language, text);
        {
            let mut rng = self.rng.lock().await;
            let bot_count = rng.next_int_range(BOT_FILL_MIN, BOT_FILL_MAX);
            for _ in 0..bot_count {
                let identity = random_bot_identity(&mut rng);
                let difficulty = random_bot_difficulty(&mut rng);
                race.participants.push(Participant::bot(&identity, difficulty));
            }
        }

        let mut room = RaceRoom::new(race, self.config.max_participants);
        room.subscribe(entry.identity.id, entry.sender.clone());

        info!(room = %room_code, bots = room.participant_count() - 1,
            "bot-fill race assembled after matchmaking timeout");
        self.launch_room(room).await;
    }

    /// Register a freshly assembled room, announce it, and begin the
    /// countdown.
    async fn launch_room(self: &Arc<Self>, mut room: RaceRoom) {
        if let Err(e) = room.start_countdown() {
            error!(room = %room.room_code(), error = %e, "assembled room could not start");
            return;
        }

        let snapshot = room.snapshot();
        let room = self.rooms.insert(room).await;

        if let Err(e) = self.store.insert_race(&snapshot).await {
            warn!(room = %snapshot.room_code, error = %e, "race document insert failed");
        }

        {
            let guard = room.read().await;
            guard
                .broadcast(ServerMessage::RaceFound {
                    room: snapshot.clone(),
                })
                .await;
        }

        self.spawn_countdown(snapshot.room_code.clone(), room).await;
    }

    // =========================================================================
    // ROOM OPERATIONS
    // =========================================================================

    /// Create a manually hosted `waiting` room and persist it.
    pub async fn create_room(
        &self,
        identity: &UserIdentity,
        mode: RaceMode,
        language: &str,
        text_content: &str,
    ) -> Result<Race, CoordinatorError> {
        if text_content.trim().is_empty() {
            return Err(CoordinatorError::Validation(
                "Text content is required".into(),
            ));
        }

        let room_code = self.allocate_room_code().await?;
        let race = Race::new(&room_code, identity, mode, language, text_content);
        let room = RaceRoom::new(race.clone(), self.config.max_participants);
        self.rooms.insert(room).await;
        self.store.insert_race(&race).await?;

        info!(room = %room_code, host = %identity.id, "race room created");
        Ok(race)
    }

    /// Idempotently add a participant to a waiting room and broadcast
    /// the updated roster. `sender` joins the broadcast group when
    /// present (the WebSocket path).
    pub async fn join_room(
        &self,
        identity: &UserIdentity,
        room_code: &str,
        sender: Option<mpsc::Sender<ServerMessage>>,
    ) -> Result<Race, CoordinatorError> {
        let room = self
            .rooms
            .get(room_code)
            .await
            .ok_or(CoordinatorError::RoomNotFound)?;

        let snapshot = {
            let mut guard = room.write().await;
            match guard.add_participant(identity) {
                Ok(()) => {}
                // Re-joining the same waiting room returns current state
                Err(RoomError::DuplicateParticipant) => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(sender) = sender {
                guard.subscribe(identity.id, sender);
            }
            let snapshot = guard.snapshot();
            guard
                .broadcast(ServerMessage::ParticipantJoined {
                    participants: snapshot.participants.clone(),
                    room: snapshot.clone(),
                })
                .await;
            snapshot
        };

        self.persist_background(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Fetch a room document: live registry first, then the store
    /// (covers finished races).
    pub async fn fetch_room(&self, room_code: &str) -> Result<Race, CoordinatorError> {
        if let Some(room) = self.rooms.get(room_code).await {
            return Ok(room.read().await.snapshot());
        }
        self.store
            .find_race(room_code)
            .await?
            .ok_or(CoordinatorError::RoomNotFound)
    }

    /// A user's recent finished races, newest first.
    pub async fn race_history(&self, user_id: &UserId) -> Result<Vec<Race>, CoordinatorError> {
        Ok(self.store.race_history(user_id, 20).await?)
    }

    /// Host-initiated start: transition a waiting room into countdown.
    pub async fn start_room(
        self: &Arc<Self>,
        room_code: &str,
        requester: &UserId,
    ) -> Result<Race, CoordinatorError> {
        let room = self
            .rooms
            .get(room_code)
            .await
            .ok_or(CoordinatorError::RoomNotFound)?;

        let snapshot = {
            let mut guard = room.write().await;
            guard.start_by_host(requester)?;
            guard.snapshot()
        };

        info!(room = %snapshot.room_code, "host started race");
        self.persist_background(snapshot.clone()).await;
        self.spawn_countdown(snapshot.room_code.clone(), room).await;
        Ok(snapshot)
    }

    /// Record a progress report. Background failures never surface:
    /// unknown rooms and stale reports are logged and dropped.
    pub async fn submit_progress(
        &self,
        room_code: &str,
        user_id: &UserId,
        progress: u8,
        wpm: u32,
        accuracy: u8,
    ) {
        let Some(room) = self.rooms.get(room_code).await else {
            debug!(room = %room_code, "progress report for unknown room");
            return;
        };
        self.apply_progress(&room, user_id, progress, wpm, accuracy)
            .await;
    }

    /// Explicit finish marker (fallback for clients whose final
    /// progress update was lost).
    pub async fn finish_race(&self, room_code: &str, user_id: &UserId) {
        let Some(room) = self.rooms.get(room_code).await else {
            debug!(room = %room_code, "finish report for unknown room");
            return;
        };

        let (finalized, snapshot) = {
            let mut guard = room.write().await;
            guard.mark_finished(user_id);
            let finalized = guard.try_finalize();
            (finalized, guard.snapshot())
        };

        if finalized {
            self.finalize_room(&room, snapshot).await;
        } else {
            self.persist_background(snapshot).await;
        }
    }

    /// Remove a member from the broadcast group. While the room is
    /// still `waiting` the participant record goes too; once countdown
    /// has begun the vacated slot stays in place.
    pub async fn leave_room(&self, room_code: &str, user_id: &UserId) {
        let Some(room) = self.rooms.get(room_code).await else {
            return;
        };

        let (empty, snapshot) = {
            let mut guard = room.write().await;
            guard.unsubscribe(user_id);
            if guard.status() == RaceStatus::Waiting {
                guard.remove_participant(user_id);
            }
            (guard.participant_count() == 0, guard.snapshot())
        };

        if empty {
            self.rooms.remove(room_code).await;
            self.teardown_tasks(room_code).await;
            debug!(room = %room_code, "removed emptied room");
        } else {
            self.persist_background(snapshot).await;
        }
    }

    /// Connection loss: drop any queue entry, leave the broadcast
    /// group, and - for a running race - arm the grace timer that
    /// eventually treats the absent participant as finished.
    pub async fn handle_disconnect(self: &Arc<Self>, user_id: &UserId, room_code: Option<&str>) {
        self.drop_queue_entry(user_id).await;

        // Matchmade rooms are joined server-side, so the connection may
        // not know its room code; fall back to a registry scan.
        let (room_code, room) = match room_code {
            Some(code) => match self.rooms.get(code).await {
                Some(room) => (code.to_string(), room),
                None => return,
            },
            None => match self.rooms.find_for_user(user_id).await {
                Some(found) => found,
                None => return,
            },
        };
        let room_code = room_code.as_str();

        let status = {
            let mut guard = room.write().await;
            guard.unsubscribe(user_id);
            if guard.status() == RaceStatus::Waiting {
                guard.remove_participant(user_id);
            }
            guard.status()
        };

        if status == RaceStatus::Started {
            let unfinished_human = {
                let guard = room.read().await;
                guard
                    .snapshot()
                    .participant(user_id)
                    .map(|p| !p.is_bot && !p.is_finished())
                    .unwrap_or(false)
            };
            if unfinished_human {
                self.spawn_disconnect_grace(room_code.to_string(), *user_id)
                    .await;
            }
        }
    }

    // =========================================================================
    // TIMER-DRIVEN TASKS
    // =========================================================================

    /// Broadcast countdown ticks, transition to `started`, then set the
    /// bot typists loose.
    async fn spawn_countdown(self: &Arc<Self>, room_code: String, room: Arc<RwLock<RaceRoom>>) {
        let coordinator = self.clone();
        let countdown_from = self.config.countdown_seconds;

        let handle = tokio::spawn(async move {
            for remaining in (0..=countdown_from).rev() {
                {
                    let guard = room.read().await;
                    guard
                        .broadcast(ServerMessage::RaceCountdown {
                            countdown: remaining,
                        })
                        .await;
                }
                if remaining > 0 {
                    sleep(Duration::from_secs(1)).await;
                }
            }

            let snapshot = {
                let mut guard = room.write().await;
                guard.begin_running();
                let snapshot = guard.snapshot();
                guard
                    .broadcast(ServerMessage::RaceStarted {
                        room: snapshot.clone(),
                    })
                    .await;
                snapshot
            };

            info!(room = %snapshot.room_code, "race started");
            coordinator.persist_background(snapshot.clone()).await;

            let total_words = snapshot.total_words();
            for participant in snapshot.participants.iter().filter(|p| p.is_bot) {
                coordinator
                    .spawn_bot_typist(snapshot.room_code.clone(), participant.clone(), total_words)
                    .await;
            }
        });

        self.track_task(&room_code, handle).await;
    }

    /// Drive one bot through the text on its own cadence.
    async fn spawn_bot_typist(
        self: &Arc<Self>,
        room_code: String,
        bot: Participant,
        total_words: usize,
    ) {
        let coordinator = self.clone();
        let code = room_code.clone();

        let handle = tokio::spawn(async move {
            let difficulty = match bot.bot_difficulty {
                Some(d) => d,
                None => return,
            };
            let seed = derive_bot_seed(&code, &bot.user_id.to_string());
            let mut typist = BotTypist::new(difficulty, total_words, seed);

            debug!(room = %code, bot = %bot.username, wpm = typist.base_wpm(),
                "bot typist running");

            loop {
                sleep(typist.step_delay()).await;

                // Room torn down - stop without emitting further updates
                let Some(room) = coordinator.rooms.get(&code).await else {
                    break;
                };

                let step = typist.step();
                coordinator
                    .apply_progress(&room, &bot.user_id, step.progress, step.wpm, step.accuracy)
                    .await;

                if step.finished {
                    break;
                }
            }
        });

        self.track_task(&room_code, handle).await;
    }

    /// Arm the disconnect grace timer for an absent participant.
    async fn spawn_disconnect_grace(self: &Arc<Self>, room_code: String, user_id: UserId) {
        let coordinator = self.clone();
        let grace = self.config.disconnect_grace;
        let code = room_code.clone();

        let handle = tokio::spawn(async move {
            sleep(grace).await;

            let Some(room) = coordinator.rooms.get(&code).await else {
                return;
            };

            let (marked, finalized, snapshot) = {
                let mut guard = room.write().await;
                let marked = guard.mark_finished(&user_id);
                let finalized = marked && guard.try_finalize();
                (marked, finalized, guard.snapshot())
            };

            if marked {
                warn!(room = %code, user = %user_id,
                    "disconnect grace elapsed, participant treated as finished");
            }
            if finalized {
                coordinator.finalize_room(&room, snapshot).await;
            } else if marked {
                coordinator.persist_background(snapshot).await;
            }
        });

        self.track_task(&room_code, handle).await;
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Apply a progress report under the room lock, broadcast the
    /// consistent participant snapshot, and finalize when it was the
    /// last outstanding finish. Returns whether the report was applied.
    async fn apply_progress(
        &self,
        room: &Arc<RwLock<RaceRoom>>,
        user_id: &UserId,
        progress: u8,
        wpm: u32,
        accuracy: u8,
    ) -> bool {
        let (finalized, snapshot) = {
            let mut guard = room.write().await;
            if !guard.record_progress(user_id, progress, wpm, accuracy) {
                return false;
            }
            guard
                .broadcast(ServerMessage::ProgressUpdated {
                    participants: guard.participants(),
                })
                .await;
            let finalized = guard.try_finalize();
            (finalized, guard.snapshot())
        };

        if finalized {
            self.finalize_room(room, snapshot).await;
        } else {
            self.persist_background(snapshot).await;
        }
        true
    }

    /// Terminal step: persist final standings (with one retry), update
    /// player statistics, broadcast the finish, and tear the room down.
    async fn finalize_room(&self, room: &Arc<RwLock<RaceRoom>>, snapshot: Race) {
        self.abort_pending_persists(&snapshot.room_code).await;

        // Standings must be durable before the race is reported
        // finished to any external reader.
        if let Err(first) = self.store.update_race(&snapshot).await {
            warn!(room = %snapshot.room_code, error = %first,
                "final standings persist failed, retrying");
            if let Err(second) = self.store.update_race(&snapshot).await {
                error!(room = %snapshot.room_code, error = %second,
                    "final standings persist failed after retry");
            }
        }

        for participant in snapshot.participants.iter().filter(|p| !p.is_bot) {
            let won = participant.position == 1;
            if let Err(e) = self.store.record_race_result(&participant.user_id, won).await {
                warn!(room = %snapshot.room_code, user = %participant.user_id,
                    error = %e, "stats update failed");
            }
        }

        {
            let guard = room.read().await;
            guard
                .broadcast(ServerMessage::RaceFinished {
                    room: snapshot.clone(),
                })
                .await;
        }

        self.rooms.remove(&snapshot.room_code).await;
        self.teardown_tasks(&snapshot.room_code).await;
        info!(room = %snapshot.room_code, "race finished");
    }

    /// Generate a room code that collides with neither a live room nor
    /// a stored document.
    async fn allocate_room_code(&self) -> Result<String, StoreError> {
        loop {
            let code = generate_room_code();
            if self.rooms.contains(&code).await {
                continue;
            }
            if self.store.find_race(&code).await?.is_some() {
                continue;
            }
            return Ok(code);
        }
    }

    /// Mirror a document to the store off the hot path. The write is
    /// fire-and-forget relative to gameplay but tracked per room so
    /// finalization can cancel anything still in flight.
    async fn persist_background(&self, race: Race) {
        let store = self.store.clone();
        let code = race.room_code.to_uppercase();
        let handle = tokio::spawn(async move {
            if let Err(e) = store.update_race(&race).await {
                warn!(room = %race.room_code, error = %e, "background race persist failed");
            }
        });

        let mut persists = self.persist_tasks.lock().await;
        let entry = persists.entry(code).or_default();
        entry.retain(|h| !h.is_finished());
        entry.push(handle);
    }

    /// Cancel in-flight mirror writes for a room; the caller is about
    /// to write an authoritative final document.
    async fn abort_pending_persists(&self, room_code: &str) {
        if let Some(handles) = self
            .persist_tasks
            .lock()
            .await
            .remove(&room_code.to_uppercase())
        {
            for handle in handles {
                handle.abort();
            }
        }
    }

    async fn track_task(&self, room_code: &str, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .await
            .entry(room_code.to_uppercase())
            .or_default()
            .push(handle);
    }

    /// Abort every background task keyed to a room. Synchronous with
    /// teardown: nothing fires against the room afterwards.
    async fn teardown_tasks(&self, room_code: &str) {
        if let Some(handles) = self.tasks.lock().await.remove(&room_code.to_uppercase()) {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

/// Default content language for matchmade rooms.
fn matchmade_language(mode: RaceMode) -> &'static str {
    match mode {
        RaceMode::Normal => "english",
        RaceMode::Code => "javascript",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::BuiltinContent;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{advance, timeout};

    fn identity(name: &str) -> UserIdentity {
        UserIdentity::new(UserId::generate(), name)
    }

    fn channel() -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(256)
    }

    fn setup() -> (Arc<RaceCoordinator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let content = Arc::new(BuiltinContent::new(7));
        let coordinator = RaceCoordinator::new(RaceConfig::default(), store.clone(), content);
        (coordinator, store)
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    /// Drain messages until one matches the predicate.
    async fn wait_for<F>(rx: &mut mpsc::Receiver<ServerMessage>, pred: F) -> ServerMessage
    where
        F: Fn(&ServerMessage) -> bool,
    {
        loop {
            let msg = recv(rx).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_create_room_requires_text() {
        let (coordinator, _store) = setup();
        let host = identity("alice");

        let result = coordinator
            .create_room(&host, RaceMode::Normal, "english", "   ")
            .await;
        match result {
            Err(CoordinatorError::Validation(message)) => {
                assert_eq!(message, "Text content is required");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_room_persists_and_registers() {
        let (coordinator, store) = setup();
        let host = identity("alice");

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "the quick brown fox")
            .await
            .unwrap();

        assert_eq!(race.status, RaceStatus::Waiting);
        assert_eq!(race.participants.len(), 1);
        assert_eq!(coordinator.room_count().await, 1);

        let stored = store.find_race(&race.room_code).await.unwrap().unwrap();
        assert_eq!(stored.room_code, race.room_code);

        let fetched = coordinator.fetch_room(&race.room_code).await.unwrap();
        assert_eq!(fetched.host_id, host.id);
    }

    #[tokio::test]
    async fn test_join_room_idempotent() {
        let (coordinator, _store) = setup();
        let host = identity("alice");
        let bob = identity("bob");

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "one two three")
            .await
            .unwrap();

        let first = coordinator.join_room(&bob, &race.room_code, None).await.unwrap();
        assert_eq!(first.participants.len(), 2);

        // Second join yields current state, no duplicate entry
        let second = coordinator.join_room(&bob, &race.room_code, None).await.unwrap();
        assert_eq!(second.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let (coordinator, _store) = setup();
        let bob = identity("bob");

        let result = coordinator.join_room(&bob, "NOSUCH", None).await;
        assert!(matches!(result, Err(CoordinatorError::RoomNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_after_start_rejected() {
        let (coordinator, _store) = setup();
        let host = identity("alice");
        let late = identity("late");

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "one two three")
            .await
            .unwrap();
        coordinator.start_room(&race.room_code, &host.id).await.unwrap();

        let result = coordinator.join_room(&late, &race.room_code, None).await;
        match result {
            Err(CoordinatorError::Room(RoomError::AlreadyStarted)) => {}
            other => panic!("expected AlreadyStarted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_room_requires_host() {
        let (coordinator, _store) = setup();
        let host = identity("alice");
        let bob = identity("bob");

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "one two three")
            .await
            .unwrap();
        coordinator.join_room(&bob, &race.room_code, None).await.unwrap();

        let result = coordinator.start_room(&race.room_code, &bob.id).await;
        match result {
            Err(CoordinatorError::Room(RoomError::NotHost)) => {}
            other => panic!("expected NotHost, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_sequence_then_started() {
        let (coordinator, _store) = setup();
        let host = identity("alice");
        let (tx, mut rx) = channel();

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "one two three")
            .await
            .unwrap();
        coordinator
            .join_room(&host, &race.room_code, Some(tx))
            .await
            .unwrap();
        // Drain the roster broadcast from joining
        wait_for(&mut rx, |m| matches!(m, ServerMessage::ParticipantJoined { .. })).await;

        coordinator.start_room(&race.room_code, &host.id).await.unwrap();

        // Full countdown is observed, strictly decreasing, before the
        // started transition is broadcast
        for expected in (0..=5u32).rev() {
            match recv(&mut rx).await {
                ServerMessage::RaceCountdown { countdown } => assert_eq!(countdown, expected),
                other => panic!("expected countdown {expected}, got {other:?}"),
            }
        }
        match recv(&mut rx).await {
            ServerMessage::RaceStarted { room } => {
                assert_eq!(room.status, RaceStatus::Started);
                assert!(room.started_at.is_some());
            }
            other => panic!("expected race-started, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_manual_race_flow() {
        let (coordinator, store) = setup();
        let host = identity("alice");
        let bob = identity("bob");
        let (host_tx, mut host_rx) = channel();
        let (bob_tx, _bob_rx) = channel();

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "some text to type here")
            .await
            .unwrap();
        let code = race.room_code.clone();

        coordinator.join_room(&host, &code, Some(host_tx)).await.unwrap();
        coordinator.join_room(&bob, &code, Some(bob_tx)).await.unwrap();
        coordinator.start_room(&code, &host.id).await.unwrap();

        wait_for(&mut host_rx, |m| matches!(m, ServerMessage::RaceStarted { .. })).await;

        // Mid-race progress fans out a consistent snapshot
        coordinator.submit_progress(&code, &bob.id, 50, 72, 96).await;
        match wait_for(&mut host_rx, |m| matches!(m, ServerMessage::ProgressUpdated { .. })).await {
            ServerMessage::ProgressUpdated { participants } => {
                assert_eq!(participants.len(), 2);
                let p = participants.iter().find(|p| p.user_id == bob.id).unwrap();
                assert_eq!(p.progress, 50);
                assert_eq!(p.wpm, 72);
            }
            _ => unreachable!(),
        }

        // Bob finishes first, then the host
        coordinator.submit_progress(&code, &bob.id, 100, 75, 97).await;
        coordinator.submit_progress(&code, &host.id, 100, 61, 93).await;

        let finished = wait_for(&mut host_rx, |m| matches!(m, ServerMessage::RaceFinished { .. })).await;
        let room = match finished {
            ServerMessage::RaceFinished { room } => room,
            _ => unreachable!(),
        };
        assert_eq!(room.status, RaceStatus::Finished);
        assert!(room.ended_at.is_some());
        assert_eq!(room.participant(&bob.id).unwrap().position, 1);
        assert_eq!(room.participant(&host.id).unwrap().position, 2);

        // Standings were durable before the broadcast
        let stored = store.find_race(&code).await.unwrap().unwrap();
        assert_eq!(stored.status, RaceStatus::Finished);

        // Winner and loser statistics
        let bob_stats = store.user_stats(&bob.id).await.unwrap();
        assert_eq!((bob_stats.total_races, bob_stats.races_won), (1, 1));
        let host_stats = store.user_stats(&host.id).await.unwrap();
        assert_eq!((host_stats.total_races, host_stats.races_won), (1, 0));

        // Room torn down
        assert_eq!(coordinator.room_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_before_start_is_dropped() {
        let (coordinator, _store) = setup();
        let host = identity("alice");

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "one two three")
            .await
            .unwrap();

        coordinator.submit_progress(&race.room_code, &host.id, 40, 50, 90).await;

        let fetched = coordinator.fetch_room(&race.room_code).await.unwrap();
        assert_eq!(fetched.participants[0].progress, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_players_group_without_timeout() {
        let (coordinator, _store) = setup();
        let _loop = coordinator.spawn_matchmaking_loop();

        let alice = identity("alice");
        let bob = identity("bob");
        let (alice_tx, mut alice_rx) = channel();
        let (bob_tx, mut bob_rx) = channel();

        coordinator
            .find_race(alice.clone(), RaceMode::Normal, alice_tx)
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut alice_rx).await,
            ServerMessage::MatchmakingStatus {
                status: MatchmakingStatus::Searching
            }
        ));

        coordinator
            .find_race(bob.clone(), RaceMode::Normal, bob_tx)
            .await
            .unwrap();

        // Grouping happens inside the grouping window, no timeout needed
        let found = wait_for(&mut alice_rx, |m| matches!(m, ServerMessage::RaceFound { .. })).await;
        let room = match found {
            ServerMessage::RaceFound { room } => room,
            _ => unreachable!(),
        };
        assert_eq!(room.participants.len(), 2);
        assert!(room.participants.iter().all(|p| !p.is_bot));
        assert_eq!(room.host_id, alice.id);

        // Both members observe the race
        wait_for(&mut bob_rx, |m| matches!(m, ServerMessage::RaceFound { .. })).await;
        assert_eq!(coordinator.queue_size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modes_never_mix_in_grouping() {
        let (coordinator, _store) = setup();
        let _loop = coordinator.spawn_matchmaking_loop();

        let alice = identity("alice");
        let bob = identity("bob");
        let (alice_tx, mut alice_rx) = channel();
        let (bob_tx, _bob_rx) = channel();

        coordinator.find_race(alice, RaceMode::Normal, alice_tx).await.unwrap();
        coordinator.find_race(bob, RaceMode::Code, bob_tx).await.unwrap();

        // Two singles in different modes: no group before the timeout
        advance(Duration::from_secs(5)).await;
        let _ = recv(&mut alice_rx).await; // searching
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(coordinator.queue_size().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_player_botfill_after_timeout() {
        let (coordinator, store) = setup();
        let _loop = coordinator.spawn_matchmaking_loop();

        let alice = identity("alice");
        let (tx, mut rx) = channel();

        coordinator.find_race(alice.clone(), RaceMode::Normal, tx).await.unwrap();
        assert!(matches!(
            recv(&mut rx).await,
            ServerMessage::MatchmakingStatus {
                status: MatchmakingStatus::Searching
            }
        ));

        // Bot-fill only fires after the full timeout elapses
        advance(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        let found = wait_for(&mut rx, |m| matches!(m, ServerMessage::RaceFound { .. })).await;
        let room = match found {
            ServerMessage::RaceFound { room } => room,
            _ => unreachable!(),
        };
        let bots = room.participants.iter().filter(|p| p.is_bot).count();
        assert!((1..=3).contains(&bots));
        assert_eq!(room.participants.len(), bots + 1);
        assert_eq!(room.host_id, alice.id);
        let code = room.room_code.clone();

        // Countdown runs to zero, then the race starts
        wait_for(&mut rx, |m| matches!(m, ServerMessage::RaceCountdown { countdown: 0 })).await;
        wait_for(&mut rx, |m| matches!(m, ServerMessage::RaceStarted { .. })).await;

        // The human finishes; the bots type to completion on their own
        coordinator.submit_progress(&code, &alice.id, 100, 64, 95).await;

        let finished = wait_for(&mut rx, |m| matches!(m, ServerMessage::RaceFinished { .. })).await;
        let room = match finished {
            ServerMessage::RaceFinished { room } => room,
            _ => unreachable!(),
        };
        assert_eq!(room.status, RaceStatus::Finished);

        // Positions are exactly {1..N}
        let mut positions: Vec<u32> = room.participants.iter().map(|p| p.position).collect();
        positions.sort_unstable();
        let expected: Vec<u32> = (1..=room.participants.len() as u32).collect();
        assert_eq!(positions, expected);

        // Only the human accrues statistics
        let stats = store.user_stats(&alice.id).await.unwrap();
        assert_eq!(stats.total_races, 1);
        for bot in room.participants.iter().filter(|p| p.is_bot) {
            let bot_stats = store.user_stats(&bot.user_id).await.unwrap();
            assert_eq!(bot_stats.total_races, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_matchmaking_stops_botfill() {
        let (coordinator, _store) = setup();
        let _loop = coordinator.spawn_matchmaking_loop();

        let alice = identity("alice");
        let (tx, mut rx) = channel();

        coordinator.find_race(alice.clone(), RaceMode::Normal, tx.clone()).await.unwrap();
        let _ = recv(&mut rx).await; // searching

        coordinator.cancel_matchmaking(&alice.id, &tx).await;
        assert!(matches!(
            recv(&mut rx).await,
            ServerMessage::MatchmakingStatus {
                status: MatchmakingStatus::Cancelled
            }
        ));

        // Well past the timeout: no bot-fill for a cancelled entry
        advance(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(coordinator.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_find_race_twice_is_already_queued() {
        let (coordinator, _store) = setup();
        let alice = identity("alice");
        let (tx, _rx) = channel();

        coordinator.find_race(alice.clone(), RaceMode::Normal, tx.clone()).await.unwrap();
        let result = coordinator.find_race(alice, RaceMode::Normal, tx).await;
        match result {
            Err(CoordinatorError::Queue(QueueError::AlreadyQueued)) => {}
            other => panic!("expected AlreadyQueued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_waiting_room_removes_participant() {
        let (coordinator, _store) = setup();
        let host = identity("alice");
        let bob = identity("bob");

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "one two three")
            .await
            .unwrap();
        coordinator.join_room(&bob, &race.room_code, None).await.unwrap();

        coordinator.leave_room(&race.room_code, &bob.id).await;
        let fetched = coordinator.fetch_room(&race.room_code).await.unwrap();
        assert_eq!(fetched.participants.len(), 1);

        // Last participant leaving empties and removes the room
        coordinator.leave_room(&race.room_code, &host.id).await;
        assert_eq!(coordinator.room_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_resolves_stalled_race() {
        let (coordinator, store) = setup();
        let host = identity("alice");
        let bob = identity("bob");
        let (host_tx, mut host_rx) = channel();
        let (bob_tx, _bob_rx) = channel();

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "some words to type")
            .await
            .unwrap();
        let code = race.room_code.clone();

        coordinator.join_room(&host, &code, Some(host_tx)).await.unwrap();
        coordinator.join_room(&bob, &code, Some(bob_tx)).await.unwrap();
        coordinator.start_room(&code, &host.id).await.unwrap();
        wait_for(&mut host_rx, |m| matches!(m, ServerMessage::RaceStarted { .. })).await;

        coordinator.submit_progress(&code, &host.id, 100, 70, 96).await;

        // Bob vanishes mid-race; the race must not stall forever
        coordinator.handle_disconnect(&bob.id, Some(&code)).await;
        assert_eq!(coordinator.room_count().await, 1);

        let finished = wait_for(&mut host_rx, |m| matches!(m, ServerMessage::RaceFinished { .. })).await;
        let room = match finished {
            ServerMessage::RaceFinished { room } => room,
            _ => unreachable!(),
        };
        assert_eq!(room.participant(&host.id).unwrap().position, 1);
        assert_eq!(room.participant(&bob.id).unwrap().position, 2);

        // Both humans accrue a played race; only the host won
        let host_stats = store.user_stats(&host.id).await.unwrap();
        assert_eq!((host_stats.total_races, host_stats.races_won), (1, 1));
        let bob_stats = store.user_stats(&bob.id).await.unwrap();
        assert_eq!((bob_stats.total_races, bob_stats.races_won), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_queued_cancels_entry() {
        let (coordinator, _store) = setup();
        let _loop = coordinator.spawn_matchmaking_loop();

        let alice = identity("alice");
        let (tx, mut rx) = channel();

        coordinator.find_race(alice.clone(), RaceMode::Normal, tx).await.unwrap();
        coordinator.handle_disconnect(&alice.id, None).await;
        assert_eq!(coordinator.queue_size().await, 0);

        // No bot-fill for the vanished player
        advance(Duration::from_secs(30)).await;
        let _ = recv(&mut rx).await; // searching
        assert!(rx.try_recv().is_err());
    }

    // A store that fails the first finalize write, to exercise the
    // retry-once policy for final standings.
    struct FailOnceStore {
        inner: MemoryStore,
        tripped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RaceStore for FailOnceStore {
        async fn insert_race(&self, race: &Race) -> Result<(), StoreError> {
            self.inner.insert_race(race).await
        }

        async fn update_race(&self, race: &Race) -> Result<(), StoreError> {
            if race.status == RaceStatus::Finished && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("simulated outage".into()));
            }
            self.inner.update_race(race).await
        }

        async fn find_race(&self, room_code: &str) -> Result<Option<Race>, StoreError> {
            self.inner.find_race(room_code).await
        }

        async fn race_history(
            &self,
            user_id: &UserId,
            limit: usize,
        ) -> Result<Vec<Race>, StoreError> {
            self.inner.race_history(user_id, limit).await
        }

        async fn record_race_result(&self, user_id: &UserId, won: bool) -> Result<(), StoreError> {
            self.inner.record_race_result(user_id, won).await
        }

        async fn user_stats(&self, user_id: &UserId) -> Result<crate::store::UserStats, StoreError> {
            self.inner.user_stats(user_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_retries_persistence_once() {
        let store = Arc::new(FailOnceStore {
            inner: MemoryStore::new(),
            tripped: AtomicBool::new(false),
        });
        let content = Arc::new(BuiltinContent::new(7));
        let coordinator =
            RaceCoordinator::new(RaceConfig::default(), store.clone(), content);

        let host = identity("alice");
        let (tx, mut rx) = channel();

        let race = coordinator
            .create_room(&host, RaceMode::Normal, "english", "tiny text")
            .await
            .unwrap();
        let code = race.room_code.clone();
        coordinator.join_room(&host, &code, Some(tx)).await.unwrap();
        coordinator.start_room(&code, &host.id).await.unwrap();
        wait_for(&mut rx, |m| matches!(m, ServerMessage::RaceStarted { .. })).await;

        coordinator.submit_progress(&code, &host.id, 100, 80, 99).await;
        wait_for(&mut rx, |m| matches!(m, ServerMessage::RaceFinished { .. })).await;

        // The retry landed the final document despite the first failure
        let stored = store.find_race(&code).await.unwrap().unwrap();
        assert_eq!(stored.status, RaceStatus::Finished);
        assert!(store.tripped.load(Ordering::SeqCst));
    }
}
