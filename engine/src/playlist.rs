//! Ordered asset list with a current pointer and a rotation timer.
//!
//! Every path that changes what is current goes through [`Playlist::land`],
//! which records the transition time and re-arms the rotation timer. Mutations
//! that invalidate the current asset never leave the pointer on it: they
//! clear it and make the rotation timer due immediately, so the next poll
//! picks a replacement.
//!
//! The playlist does not call anybody back. Changes are queued as
//! [`PlaylistEvent`]s and drained by the owner after each mutation.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::asset::{is_valid_url, Asset, AssetDuration, AssetEdit, MediaType, FILE_SCHEME};
use crate::error::{PlaylistError, PlaylistResult};
use crate::show::Fallback;
use crate::timer::{earliest, Timer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistEvent {
    /// Asset list contents changed (persist + tell control clients).
    Items,
    /// The current asset changed; `None` means a fallback page is showing.
    Current(Option<String>),
}

/// Where `goto` should land.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GotoTarget {
    /// Re-assert whatever is current.
    #[default]
    Current,
    Index(usize),
    Uuid(String),
}

/// What the display should be showing right now.
#[derive(Debug, Clone, Copy)]
pub enum Showing<'a> {
    Asset(&'a Asset),
    Fallback(Fallback),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug)]
pub struct Playlist {
    assets: Vec<Asset>,
    current: Option<usize>,
    /// Uuid rotation resumes after when the current asset was removed.
    resume_after: Option<String>,
    /// The current pointer must be re-evaluated on the next poll; no re-arm
    /// may push the rotation deadline out until it has landed.
    reevaluate: bool,
    last_transition: Instant,
    rotation: Timer,
    default_duration: u32,
    first_boot: bool,
    transitions: u64,
    events: Vec<PlaylistEvent>,
}

impl Playlist {
    pub fn new(default_duration: u32) -> Self {
        Self {
            assets: Vec::new(),
            current: None,
            resume_after: None,
            reevaluate: false,
            last_transition: Instant::now(),
            rotation: Timer::idle(),
            default_duration,
            first_boot: false,
            transitions: 0,
            events: Vec::new(),
        }
    }

    /// Build from persisted assets. Dates that went by while the device was
    /// off are resolved here; duplicated uuids get a fresh one.
    pub fn from_assets(assets: Vec<Asset>, default_duration: u32, first_boot: bool) -> Self {
        let mut p = Self::new(default_duration);
        p.first_boot = first_boot;
        for mut asset in assets {
            if p.index_of(asset.uuid()).is_some() {
                warn!("duplicate asset uuid {} in configuration, assigning a new one", asset.uuid());
                asset = asset.with_uuid(Uuid::new_v4().to_string());
            }
            asset.settle();
            p.assets.push(asset);
        }
        p
    }

    // --- queries --------------------------------------------------------

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn index_of(&self, uuid: &str) -> Option<usize> {
        self.assets.iter().position(|a| a.uuid() == uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.uuid() == uuid)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Wire form of the current pointer (`-1` when nothing is current).
    pub fn current_index_wire(&self) -> i64 {
        self.current.map_or(-1, |i| i as i64)
    }

    pub fn current(&self) -> Option<&Asset> {
        self.current.and_then(|i| self.assets.get(i))
    }

    pub fn current_uuid(&self) -> Option<String> {
        self.current().map(|a| a.uuid().to_string())
    }

    pub fn enabled_count(&self) -> usize {
        self.assets.iter().filter(|a| a.enabled()).count()
    }

    pub fn has_enabled(&self) -> bool {
        self.assets.iter().any(|a| a.enabled())
    }

    pub fn default_duration(&self) -> u32 {
        self.default_duration
    }

    pub fn rotation(&self) -> &Timer {
        &self.rotation
    }

    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    /// Bumped every time the display must be (re)rendered.
    pub fn transition_id(&self) -> u64 {
        self.transitions
    }

    pub fn first_boot(&self) -> bool {
        self.first_boot
    }

    pub fn fallback(&self) -> Fallback {
        if self.first_boot {
            Fallback::FirstBoot
        } else {
            Fallback::NoAssets
        }
    }

    pub fn showing(&self) -> Showing<'_> {
        match self.current() {
            Some(a) => Showing::Asset(a),
            None => Showing::Fallback(self.fallback()),
        }
    }

    /// Earliest deadline among the rotation timer and every asset date.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.assets
            .iter()
            .fold(self.rotation.deadline(), |acc, a| earliest(acc, a.next_deadline()))
    }

    /// Drain queued change notifications, collapsing repeats.
    pub fn take_events(&mut self) -> Vec<PlaylistEvent> {
        let mut out: Vec<PlaylistEvent> = Vec::with_capacity(self.events.len());
        for ev in self.events.drain(..) {
            match ev {
                PlaylistEvent::Items if out.contains(&PlaylistEvent::Items) => {}
                PlaylistEvent::Current(_) => {
                    out.retain(|e| !matches!(e, PlaylistEvent::Current(_)));
                    out.push(ev);
                }
                _ => out.push(ev),
            }
        }
        out
    }

    // --- rotation -------------------------------------------------------

    /// Advance to the next enabled asset (any asset when `force`).
    pub fn next(&mut self, force: bool) -> Option<&Asset> {
        self.step(Direction::Forward, force);
        self.current()
    }

    /// Mirror of [`Playlist::next`], scanning backwards.
    pub fn prev(&mut self, force: bool) -> Option<&Asset> {
        self.step(Direction::Backward, force);
        self.current()
    }

    /// Jump directly, bypassing the enabled check.
    pub fn goto(&mut self, target: GotoTarget) -> PlaylistResult<Option<&Asset>> {
        match target {
            GotoTarget::Current => match self.current {
                Some(i) if !self.reevaluate => self.land(Some(i)),
                _ => self.step(Direction::Forward, false),
            },
            GotoTarget::Index(index) => {
                if index >= self.assets.len() {
                    return Err(PlaylistError::IndexOutOfRange {
                        index,
                        len: self.assets.len(),
                    });
                }
                self.land(Some(index));
            }
            GotoTarget::Uuid(uuid) => {
                let index = self
                    .index_of(&uuid)
                    .ok_or(PlaylistError::UnknownAsset(uuid))?;
                self.land(Some(index));
            }
        }
        Ok(self.current())
    }

    /// Make the rotation due now without changing the pointer. The scheduler
    /// loop calls this when it starts so the first poll picks an asset.
    pub fn kick(&mut self) {
        self.rotation.fire_now();
    }

    /// Fire due asset dates, then the rotation timer.
    pub fn poll(&mut self) {
        let now = Instant::now();
        let mut toggled = false;
        for index in 0..self.assets.len() {
            let had_enabled = self.has_enabled();
            let was = self.assets[index].enabled();
            if self.assets[index].poll(now) {
                debug!(
                    uuid = self.assets[index].uuid(),
                    enabled = self.assets[index].enabled(),
                    "asset date reached"
                );
                toggled = true;
                self.after_toggle(index, was, had_enabled);
            }
        }
        if toggled {
            self.events.push(PlaylistEvent::Items);
        }
        if self.rotation.take_due(Instant::now()) {
            self.step(Direction::Forward, false);
        }
    }

    fn step(&mut self, dir: Direction, force: bool) {
        let len = self.assets.len();
        if len == 0 || (!force && !self.has_enabled()) {
            self.land(None);
            return;
        }

        let resume = self
            .resume_after
            .as_deref()
            .and_then(|u| self.index_of(u));
        let advance = |i: usize| match dir {
            Direction::Forward => (i + 1) % len,
            Direction::Backward => (i + len - 1) % len,
        };
        // `resume_after` is the predecessor of a removed asset: forward
        // continues past it, backward lands on it.
        let mut index = match (self.current, resume, dir) {
            (Some(i), _, _) => advance(i),
            (None, Some(r), Direction::Forward) => advance(r),
            (None, Some(r), Direction::Backward) => r,
            (None, None, Direction::Forward) => 0,
            (None, None, Direction::Backward) => len - 1,
        };
        if !force {
            // Terminates: at least one asset is enabled.
            while !self.assets[index].enabled() {
                index = advance(index);
            }
        }
        self.land(Some(index));
    }

    /// The single place the current pointer changes.
    fn land(&mut self, index: Option<usize>) {
        self.current = index;
        self.resume_after = None;
        self.reevaluate = false;
        self.last_transition = Instant::now();
        self.transitions += 1;
        self.arm_rotation();
        self.events.push(PlaylistEvent::Current(self.current_uuid()));
    }

    fn current_duration(&self) -> Option<Duration> {
        self.current()
            .and_then(|a| a.duration.resolve(self.default_duration))
    }

    /// Deadline relative to the last transition, so edits to the current
    /// asset's duration keep the time it has already been on screen.
    fn arm_rotation(&mut self) {
        if self.reevaluate {
            self.rotation.fire_now();
            return;
        }
        match self.current_duration() {
            Some(d) => self.rotation.arm_after(self.last_transition, d),
            None => self.rotation.cancel(),
        }
    }

    /// Make the next poll pick a new current asset.
    fn force_reevaluation(&mut self) {
        self.reevaluate = true;
        self.rotation.fire_now();
    }

    /// Restart rotation from the top of the list.
    fn restart(&mut self) {
        self.current = None;
        self.resume_after = None;
        self.force_reevaluation();
    }

    /// Re-render the current asset without touching its timing.
    fn reshow(&mut self) {
        self.transitions += 1;
    }

    // --- structural mutations -------------------------------------------

    /// Run a structural change, keeping the current pointer on the same
    /// asset. If that asset is gone, rotation resumes after its predecessor
    /// immediately.
    fn restructure<R>(&mut self, f: impl FnOnce(&mut Vec<Asset>) -> R) -> R {
        let had_enabled = self.has_enabled();
        let current = self.current_uuid();
        let predecessor = self.current.and_then(|i| {
            let len = self.assets.len();
            let p = (i + len - 1) % len;
            (p != i).then(|| self.assets[p].uuid().to_string())
        });

        let out = f(&mut self.assets);

        if let Some(uuid) = current {
            match self.index_of(&uuid) {
                Some(i) => self.current = Some(i),
                None => {
                    self.current = None;
                    self.resume_after = predecessor;
                    self.force_reevaluation();
                }
            }
        }
        if !had_enabled && self.has_enabled() {
            self.restart();
        }
        self.events.push(PlaylistEvent::Items);
        out
    }

    fn with_unique_uuid(&self, asset: Asset) -> Asset {
        if self.index_of(asset.uuid()).is_some() {
            asset.with_uuid(Uuid::new_v4().to_string())
        } else {
            asset
        }
    }

    pub fn append(&mut self, asset: Asset) -> String {
        let index = self.assets.len();
        self.insert_at(index, asset)
    }

    pub fn insert(&mut self, index: usize, asset: Asset) -> PlaylistResult<String> {
        if index > self.assets.len() {
            return Err(PlaylistError::IndexOutOfRange {
                index,
                len: self.assets.len(),
            });
        }
        Ok(self.insert_at(index, asset))
    }

    fn insert_at(&mut self, index: usize, asset: Asset) -> String {
        let mut asset = self.with_unique_uuid(asset);
        asset.settle();
        let uuid = asset.uuid().to_string();
        self.restructure(|v| v.insert(index, asset));
        uuid
    }

    pub fn remove(&mut self, uuid: &str) -> PlaylistResult<Asset> {
        let index = self
            .index_of(uuid)
            .ok_or_else(|| PlaylistError::UnknownAsset(uuid.to_string()))?;
        Ok(self.restructure(|v| v.remove(index)))
    }

    /// Drop every asset backed by the uploaded file `name`.
    pub fn remove_file(&mut self, name: &str) -> usize {
        if !self.assets.iter().any(|a| a.file_name() == Some(name)) {
            return 0;
        }
        self.restructure(|v| {
            let before = v.len();
            v.retain(|a| a.file_name() != Some(name));
            before - v.len()
        })
    }

    pub fn move_item(&mut self, from: usize, to: usize) -> PlaylistResult<()> {
        let len = self.assets.len();
        for index in [from, to] {
            if index >= len {
                return Err(PlaylistError::IndexOutOfRange { index, len });
            }
        }
        if from != to {
            self.restructure(|v| {
                let a = v.remove(from);
                v.insert(to, a);
            });
        }
        Ok(())
    }

    /// Swap the asset at `index` for a new one. If it was current, the
    /// replacement is considered immediately.
    pub fn replace(&mut self, index: usize, asset: Asset) -> PlaylistResult<Asset> {
        if index >= self.assets.len() {
            return Err(PlaylistError::IndexOutOfRange {
                index,
                len: self.assets.len(),
            });
        }
        let mut asset = self.with_unique_uuid(asset);
        asset.settle();
        Ok(self.restructure(|v| std::mem::replace(&mut v[index], asset)))
    }

    // --- per-asset mutations --------------------------------------------

    /// Apply enable/disable side effects after an asset's `enabled` changed.
    fn after_toggle(&mut self, index: usize, was: bool, had_enabled: bool) {
        let is = self.assets[index].enabled();
        if !was && is && !had_enabled {
            self.restart();
        } else if was && !is && self.current == Some(index) {
            self.force_reevaluation();
        }
    }

    fn with_asset<R>(&mut self, index: usize, f: impl FnOnce(&mut Asset) -> R) -> R {
        let had_enabled = self.has_enabled();
        let was = self.assets[index].enabled();
        let out = f(&mut self.assets[index]);
        self.after_toggle(index, was, had_enabled);
        self.events.push(PlaylistEvent::Items);
        out
    }

    fn require(&self, uuid: &str) -> PlaylistResult<usize> {
        self.index_of(uuid)
            .ok_or_else(|| PlaylistError::UnknownAsset(uuid.to_string()))
    }

    pub fn enable(&mut self, uuid: &str) -> PlaylistResult<()> {
        let index = self.require(uuid)?;
        self.with_asset(index, Asset::enable);
        Ok(())
    }

    pub fn disable(&mut self, uuid: &str) -> PlaylistResult<()> {
        let index = self.require(uuid)?;
        self.with_asset(index, Asset::disable);
        Ok(())
    }

    pub fn set_duration(&mut self, uuid: &str, duration: AssetDuration) -> PlaylistResult<()> {
        let index = self.require(uuid)?;
        self.with_asset(index, |a| a.duration = duration);
        if self.current == Some(index) {
            self.arm_rotation();
        }
        Ok(())
    }

    pub fn set_default_duration(&mut self, secs: u32) {
        if self.default_duration == secs {
            return;
        }
        self.default_duration = secs;
        self.events.push(PlaylistEvent::Items);
        if matches!(self.current(), Some(a) if a.duration == AssetDuration::Default) {
            self.arm_rotation();
        }
    }

    /// Partial edit. Every field is applied through the same paths as the
    /// dedicated operations so timers and rotation stay consistent.
    pub fn edit(&mut self, edit: AssetEdit) -> PlaylistResult<()> {
        let index = self.require(&edit.uuid)?;
        if let Some(url) = &edit.url {
            if !url.starts_with(FILE_SCHEME) && !is_valid_url(url) {
                return Err(PlaylistError::InvalidUrl(url.clone()));
            }
        }
        let mut rerender = false;
        {
            let a = &mut self.assets[index];
            if let Some(name) = edit.name {
                a.name = name;
            }
            if let Some(url) = edit.url {
                if a.url != url {
                    a.url = url;
                    a.media_type = MediaType::Undefined;
                    rerender = true;
                }
            }
            if let Some(fit) = edit.fit {
                rerender |= a.fit != fit;
                a.fit = fit;
            }
            if let Some(color) = edit.background_color {
                rerender |= a.background_color != color;
                a.background_color = color;
            }
        }
        if let Some(duration) = edit.duration {
            self.set_duration(&edit.uuid, duration)?;
        }
        if let Some(at) = edit.activation_at {
            self.with_asset(index, |a| a.set_activation(at));
        }
        if let Some(at) = edit.deactivation_at {
            self.with_asset(index, |a| a.set_deactivation(at));
        }
        match edit.enabled {
            Some(true) => self.enable(&edit.uuid)?,
            Some(false) => self.disable(&edit.uuid)?,
            None => {}
        }
        if rerender && self.current == Some(index) {
            self.reshow();
        }
        self.events.push(PlaylistEvent::Items);
        Ok(())
    }

    /// Record the media type the renderer detected for the current asset.
    pub fn set_current_media_type(&mut self, media_type: MediaType) {
        if let Some(i) = self.current {
            if self.assets[i].media_type != media_type {
                self.assets[i].media_type = media_type;
                self.events.push(PlaylistEvent::Items);
            }
        }
    }

    /// The configuration has been saved at least once. Returns `true` the
    /// first time.
    pub fn mark_configured(&mut self) -> bool {
        if !self.first_boot {
            return false;
        }
        self.first_boot = false;
        if self.current.is_none() {
            self.reshow();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(enabled: bool, secs: f64) -> Asset {
        Asset::new(format!("https://example.com/{}", Uuid::new_v4()))
            .with_enabled(enabled)
            .with_duration(AssetDuration::Seconds(secs))
    }

    fn playlist(items: Vec<Asset>) -> (Playlist, Vec<String>) {
        let uuids = items.iter().map(|a| a.uuid().to_string()).collect();
        (Playlist::from_assets(items, 30, false), uuids)
    }

    async fn advance(secs: u64) {
        tokio::time::advance(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn auto_advance_skips_disabled_and_rearms() {
        let (mut p, ids) = playlist(vec![asset(true, 5.0), asset(false, 7.0), asset(true, 10.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(5)));

        advance(5).await;
        p.poll();
        assert_eq!(p.current_uuid().as_deref(), Some(ids[2].as_str()));
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(10)));

        // Deleting the current asset mid-interval forces an advance.
        advance(3).await;
        p.remove(&ids[2]).unwrap();
        assert_eq!(p.rotation().remaining(), Some(Duration::ZERO));
        assert_eq!(p.current_index(), None);

        p.poll();
        assert_eq!(p.current_uuid().as_deref(), Some(ids[0].as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn non_forced_next_never_lands_on_disabled() {
        let (mut p, ids) = playlist((0..6).map(|i| asset(i % 2 == 0, 1.0)).collect());
        // Deterministic pseudo-random enable/disable walk.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let uuid = &ids[(seed % ids.len() as u64) as usize];
            if seed & 0x100 == 0 {
                p.enable(uuid).unwrap();
            } else {
                p.disable(uuid).unwrap();
            }
            match p.next(false) {
                Some(a) => assert!(a.enabled()),
                None => assert_eq!(p.enabled_count(), 0),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forced_navigation_bypasses_enabled_check() {
        let (mut p, ids) = playlist(vec![asset(true, 5.0), asset(false, 5.0), asset(true, 5.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        assert_eq!(p.next(true).map(|a| a.uuid().to_string()), Some(ids[1].clone()));
        assert_eq!(p.prev(false).map(|a| a.uuid().to_string()), Some(ids[0].clone()));
        assert_eq!(p.prev(false).map(|a| a.uuid().to_string()), Some(ids[2].clone()));
        p.goto(GotoTarget::Uuid(ids[1].clone())).unwrap();
        assert_eq!(p.current_index(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn all_disabled_clears_pointer_and_picks_fallback() {
        let mut p = Playlist::from_assets(vec![asset(false, 5.0)], 30, true);
        assert!(p.next(false).is_none());
        assert_eq!(p.current_index_wire(), -1);
        assert!(!p.rotation().is_armed());
        assert_eq!(p.fallback(), Fallback::FirstBoot);

        let before = p.transition_id();
        assert!(p.mark_configured());
        assert!(!p.mark_configured());
        assert_eq!(p.fallback(), Fallback::NoAssets);
        assert!(p.transition_id() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn editing_current_duration_keeps_elapsed_time() {
        let (mut p, ids) = playlist(vec![asset(true, 20.0), asset(true, 5.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        advance(8).await;

        p.set_duration(&ids[0], AssetDuration::Seconds(30.0)).unwrap();
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(22)));

        p.set_duration(&ids[0], AssetDuration::Seconds(5.0)).unwrap();
        assert_eq!(p.rotation().remaining(), Some(Duration::ZERO));
        p.poll();
        assert_eq!(p.current_index(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_duration_disarms_rotation() {
        let (mut p, ids) = playlist(vec![asset(true, 5.0), asset(true, 5.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        p.set_duration(&ids[0], AssetDuration::Infinite).unwrap();
        assert!(!p.rotation().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn enabling_first_asset_restarts_from_top() {
        let (mut p, ids) = playlist(vec![asset(false, 5.0), asset(false, 5.0), asset(false, 5.0)]);
        p.next(false);
        assert_eq!(p.current_index(), None);

        p.enable(&ids[2]).unwrap();
        p.enable(&ids[1]).unwrap();
        assert_eq!(p.rotation().remaining(), Some(Duration::ZERO));
        p.poll();
        assert_eq!(p.current_index(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_current_reevaluates_immediately() {
        let (mut p, ids) = playlist(vec![asset(true, 60.0), asset(true, 60.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        p.disable(&ids[0]).unwrap();
        assert_eq!(p.rotation().remaining(), Some(Duration::ZERO));
        p.poll();
        assert_eq!(p.current_index(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_reevaluation_survives_rearms() {
        let (mut p, ids) = playlist(vec![asset(true, 60.0), asset(true, 60.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        p.disable(&ids[0]).unwrap();
        // Further edits before the next poll must not push the deadline out.
        p.set_duration(&ids[0], AssetDuration::Seconds(90.0)).unwrap();
        p.set_default_duration(45);
        assert_eq!(p.rotation().remaining(), Some(Duration::ZERO));

        p.poll();
        assert_eq!(p.current_index(), Some(1));
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_edited_duration_never_rotates() {
        let (mut p, ids) = playlist(vec![asset(true, 60.0), asset(true, 60.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        let edit: AssetEdit =
            serde_json::from_value(serde_json::json!({"uuid": ids[0], "duration": 1e20})).unwrap();
        p.edit(edit).unwrap();
        assert_eq!(p.assets()[0].duration, AssetDuration::Infinite);
        assert_eq!(p.rotation().remaining(), None);

        advance(3600).await;
        p.poll();
        assert_eq!(p.current_index(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn goto_current_moves_on_from_disabled_current() {
        let (mut p, ids) = playlist(vec![asset(true, 60.0), asset(true, 60.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        p.disable(&ids[0]).unwrap();
        p.goto(GotoTarget::Current).unwrap();
        assert_eq!(p.current_index(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn back_after_removing_current_lands_on_predecessor() {
        let (mut p, ids) = playlist(vec![asset(true, 5.0), asset(true, 5.0), asset(true, 5.0)]);
        p.goto(GotoTarget::Index(1)).unwrap();
        p.remove(&ids[1]).unwrap();
        assert_eq!(p.prev(true).map(|a| a.uuid().to_string()), Some(ids[0].clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn structural_edits_keep_current_identity() {
        let (mut p, ids) = playlist(vec![asset(true, 60.0), asset(true, 60.0), asset(true, 60.0)]);
        p.goto(GotoTarget::Index(1)).unwrap();
        advance(10).await;

        p.insert(0, asset(true, 5.0)).unwrap();
        assert_eq!(p.current_index(), Some(2));
        p.move_item(2, 0).unwrap();
        assert_eq!(p.current_index(), Some(0));
        p.remove(&ids[2]).unwrap();
        assert_eq!(p.current_uuid().as_deref(), Some(ids[1].as_str()));
        // Timing is untouched by edits that keep the identity.
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn removing_current_resumes_after_predecessor() {
        let (mut p, ids) = playlist(vec![asset(true, 5.0), asset(true, 5.0), asset(true, 5.0)]);
        p.goto(GotoTarget::Index(1)).unwrap();
        p.remove(&ids[1]).unwrap();
        p.poll();
        assert_eq!(p.current_uuid().as_deref(), Some(ids[2].as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_current_shows_replacement() {
        let (mut p, _) = playlist(vec![asset(true, 5.0), asset(true, 5.0)]);
        p.goto(GotoTarget::Index(1)).unwrap();
        let replacement = asset(true, 9.0);
        let new_uuid = replacement.uuid().to_string();
        p.replace(1, replacement).unwrap();
        p.poll();
        assert_eq!(p.current_uuid(), Some(new_uuid));
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_errors_leave_state_alone() {
        let (mut p, _) = playlist(vec![asset(true, 5.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        let id = p.transition_id();
        assert!(matches!(
            p.goto(GotoTarget::Index(4)),
            Err(PlaylistError::IndexOutOfRange { index: 4, len: 1 })
        ));
        assert!(matches!(p.remove("nope"), Err(PlaylistError::UnknownAsset(_))));
        assert!(p.move_item(0, 3).is_err());
        assert_eq!(p.transition_id(), id);
        assert_eq!(p.current_index(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn activation_date_restarts_rotation() {
        let now = time::OffsetDateTime::now_utc();
        let a = asset(false, 5.0).with_activation(Some(now + time::Duration::seconds(10)));
        let b = asset(false, 5.0);
        let a_uuid = a.uuid().to_string();
        let mut p = Playlist::from_assets(vec![b, a], 30, false);
        p.kick();
        p.poll();
        assert_eq!(p.current_index(), None);

        advance(10).await;
        p.poll();
        assert_eq!(p.current_uuid(), Some(a_uuid));
        assert!(p.current().unwrap().activation_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_date_on_current_advances() {
        let now = time::OffsetDateTime::now_utc();
        let a = asset(true, 60.0).with_deactivation(Some(now + time::Duration::seconds(4)));
        let (mut p, ids) = playlist(vec![a, asset(true, 60.0)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        assert!(p.next_deadline().unwrap() <= Instant::now() + Duration::from_secs(4));

        advance(4).await;
        p.poll();
        assert_eq!(p.current_uuid().as_deref(), Some(ids[1].as_str()));
        assert!(!p.assets()[0].enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_collapsed() {
        let (mut p, ids) = playlist(vec![asset(true, 5.0), asset(true, 5.0)]);
        p.take_events();
        p.next(false);
        p.disable(&ids[1]).unwrap();
        p.enable(&ids[1]).unwrap();
        p.next(false);
        let events = p.take_events();
        assert_eq!(
            events,
            vec![PlaylistEvent::Items, PlaylistEvent::Current(Some(ids[1].clone()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn default_duration_change_rearms_relative() {
        let (mut p, _) = playlist(vec![Asset::new("https://example.com").with_enabled(true)]);
        p.goto(GotoTarget::Index(0)).unwrap();
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(30)));
        advance(10).await;
        p.set_default_duration(15);
        assert_eq!(p.rotation().remaining(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_file_drops_backed_assets() {
        let (mut p, _) = playlist(vec![
            Asset::new("file:a.png").with_enabled(true),
            Asset::new("file:b.png"),
            Asset::new("file:a.png"),
        ]);
        assert_eq!(p.remove_file("a.png"), 2);
        assert_eq!(p.len(), 1);
        assert_eq!(p.remove_file("missing.png"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_rejects_bad_url_and_rerenders_current() {
        let a = Asset::new("https://example.com/a")
            .with_enabled(true)
            .with_media_type(MediaType::Video);
        let (mut p, ids) = playlist(vec![a]);
        p.goto(GotoTarget::Index(0)).unwrap();
        let before = p.transition_id();

        let bad = AssetEdit {
            uuid: ids[0].clone(),
            url: Some("ftp://nope".into()),
            ..Default::default()
        };
        assert!(matches!(p.edit(bad), Err(PlaylistError::InvalidUrl(_))));
        assert_eq!(p.current().unwrap().url, "https://example.com/a");

        let good = AssetEdit {
            uuid: ids[0].clone(),
            url: Some("https://example.com/b".into()),
            name: Some("Menu".into()),
            ..Default::default()
        };
        p.edit(good).unwrap();
        let current = p.current().unwrap();
        assert_eq!(current.name, "Menu");
        assert_eq!(current.media_type, MediaType::Undefined);
        assert!(p.transition_id() > before);
    }
}
