//! Wiring for one running client: backend handles, shared settings, the
//! event bus and every service built on them.

use crate::account::AccountService;
use crate::admin::AdminService;
use crate::error::Result;
use crate::events::EventBus;
use crate::messaging::ChatService;
use crate::profiles::Profiles;
use crate::random::{RandomChat, RandomPairing};
use crate::schema;
use crate::settings::SystemSettings;
use crate::status::StatusService;
use nxs_backend::{AuthBackend, Backend, HostedBackend, MemoryBackend};
use nxs_common::DataLayout;
use parking_lot::RwLock;
use std::sync::Arc;

pub struct AppContext {
    layout: DataLayout,
    backend: Arc<dyn Backend>,
    settings: Arc<RwLock<SystemSettings>>,
    events: EventBus,
    profiles: Arc<Profiles>,
    account: AccountService,
    chats: ChatService,
    statuses: StatusService,
    random: RandomPairing,
    admin: AdminService,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("root", &self.layout.root())
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Build every service over the given backend. Creates the data
    /// directories and loads settings from the layout.
    pub fn new(
        backend: Arc<dyn Backend>,
        auth: Arc<dyn AuthBackend>,
        layout: DataLayout,
    ) -> Result<Self> {
        layout.init()?;
        let settings = Arc::new(RwLock::new(SystemSettings::load(&layout.settings_file())?));
        let events = EventBus::default();
        let profiles = Arc::new(Profiles::new(backend.clone()));

        let chats = ChatService::new(
            backend.clone(),
            profiles.clone(),
            settings.clone(),
            events.clone(),
        );
        let statuses = StatusService::new(
            backend.clone(),
            profiles.clone(),
            settings.clone(),
            events.clone(),
        );
        let random = RandomPairing::new(chats.clone(), settings.clone());
        let account = AccountService::new(
            backend.clone(),
            auth,
            profiles.clone(),
            layout.session_file(),
        );
        let admin = AdminService::new(
            backend.clone(),
            profiles.clone(),
            settings.clone(),
            layout.settings_file(),
        );

        Ok(Self {
            layout,
            backend,
            settings,
            events,
            profiles,
            account,
            chats,
            statuses,
            random,
            admin,
        })
    }

    /// Connect to the hosted platform configured in the environment.
    pub fn hosted(layout: DataLayout) -> Result<Self> {
        let backend = Arc::new(HostedBackend::from_env()?);
        Self::new(backend.clone(), backend, layout)
    }

    /// A self-contained client over [`schema::memory_backend`]. The backend
    /// handle is returned for sharing with other contexts.
    pub fn in_memory(layout: DataLayout) -> Result<(Self, Arc<MemoryBackend>)> {
        let backend = Arc::new(schema::memory_backend());
        let context = Self::new(backend.clone(), backend.clone(), layout)?;
        Ok((context, backend))
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn profiles(&self) -> &Arc<Profiles> {
        &self.profiles
    }

    pub fn settings(&self) -> SystemSettings {
        self.settings.read().clone()
    }

    /// Re-read settings from disk, e.g. after another process saved them.
    pub fn reload_settings(&self) -> Result<()> {
        let fresh = SystemSettings::load(&self.layout.settings_file())?;
        *self.settings.write() = fresh;
        Ok(())
    }

    pub fn account(&self) -> &AccountService {
        &self.account
    }

    pub fn chats(&self) -> &ChatService {
        &self.chats
    }

    pub fn statuses(&self) -> &StatusService {
        &self.statuses
    }

    pub fn random(&self) -> &RandomPairing {
        &self.random
    }

    /// Random-chat state machine for the signed-in user.
    pub fn random_chat(&self) -> Result<RandomChat> {
        let user_id = self.account.require_user_id()?;
        Ok(RandomChat::new(self.random.clone(), user_id))
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }
}
