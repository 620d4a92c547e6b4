//! The module engine.
//!
//! A [`Module`] owns one device's protocol lifecycle: it takes on an identity
//! from a roll call, derives its active parameter specs from that identity,
//! serves reads by dispatching each name to the block, poll or postbox
//! handler, and writes blocks read-modify-write.
//!
//! All state lives behind async locks so a module can be shared between the
//! scheduler, the poll pipeline and command handlers as an `Arc<Module>`.

use crate::{
    address_map::AddressMap,
    block_io::BlockAccess,
    config::ModuleSettings,
    events::{Event, EventBus, EventData, Subscription},
    identity::{ModuleIdentity, RollCall},
    param::{param, CType, ParamBits, ParamCType, ParamMask, ParamMaskBool, ParamSpec},
    protocol::{self as proto, ModuleStatus},
    schedule::Schedule,
    state::ModuleState,
    table::ParameterTable,
    value::{Value, Values},
    Error, Result,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};

pub const DEV_ID_KEY: &str = "dev-id";
pub const POSTBOX_SELECTION: &str = "postbox-selection";
pub const POSTBOX_TIMESTAMP: &str = "postbox-timestamp";

const AIM_ROLES: [(u16, &str); 3] = [(48, "flags"), (49, "analog"), (50, "power")];
const RTD1_ROLES: [(u16, &str); 2] = [(54, "flags"), (55, "temp")];
const GASGUARD2_ROLES: [(u16, &str); 3] = [(61, "flags"), (62, "analog"), (63, "power")];

/// Device family, selected by the module type code of the roll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Single address module without family specific behaviour (SIM-T, SIM-G, unknown types).
    Generic,
    Lim,
    Di4,
    /// RO4 and DO4.
    Ro4,
    SimP,
    Aim,
    Rtd1,
    GasGuard2,
    /// Remote tripping station, a controller rather than a bus module.
    Rts,
}

impl Family {
    pub fn from_module_type(module_type: u16) -> Self {
        match module_type {
            7 => Family::Lim,
            15 => Family::Di4,
            35 => Family::SimP,
            39 | 40 => Family::Ro4,
            48..=50 => Family::Aim,
            54 | 55 => Family::Rtd1,
            61..=63 => Family::GasGuard2,
            _ => Family::Generic,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::Generic => "imac-module-unknown",
            Family::Lim => "imac-module-lim",
            Family::Di4 => "imac-module-di4",
            Family::Ro4 => "imac-module-ro4",
            Family::SimP => "imac-module-sim-p",
            Family::Aim => "imac-module-aim",
            Family::Rtd1 => "imac-module-rtd1",
            Family::GasGuard2 => "imac-module-gg2",
            Family::Rts => "imac-controller-rts",
        }
    }

    /// Module type codes and role names of a multi-role family.
    pub fn roles(&self) -> &'static [(u16, &'static str)] {
        match self {
            Family::Aim => &AIM_ROLES,
            Family::Rtd1 => &RTD1_ROLES,
            Family::GasGuard2 => &GASGUARD2_ROLES,
            _ => &[],
        }
    }

    pub fn is_multi_role(&self) -> bool {
        !self.roles().is_empty()
    }

    pub fn role(&self, module_type: u16) -> Option<&'static str> {
        self.roles()
            .iter()
            .find(|(code, _)| *code == module_type)
            .map(|(_, role)| *role)
    }

    /// Parameters fetched right after identification when still unknown.
    pub fn starting_parameters(&self) -> Vec<String> {
        match self {
            Family::Di4 | Family::Ro4 => (1..=4).map(|n| format!("invert-status-{n}")).collect(),
            Family::Lim => vec!["mode".into()],
            Family::SimP => vec!["modbus-start-address".into(), "modbus-register-count".into()],
            Family::Aim => role_keys("address-", &AIM_ROLES),
            Family::GasGuard2 => {
                let mut names = role_keys("address-", &GASGUARD2_ROLES);
                names.push("address-bypass".into());
                names
            }
            Family::Generic | Family::Rtd1 | Family::Rts => Vec::new(),
        }
    }

    /// Raw and derived field prefixes of the IO feedback of DI4/RO4 modules.
    fn feedback(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Family::Di4 => Some(("switch-status-raw-", "switch-status-")),
            Family::Ro4 => Some(("relay-status-raw-", "relay-status-")),
            _ => None,
        }
    }

    /// Fields whose trigger topics the module listens to.
    pub fn trigger_fields(&self) -> Vec<String> {
        match self.feedback() {
            Some((raw, _)) => (1..=4)
                .flat_map(|n| [format!("{raw}{n}"), format!("invert-status-{n}")])
                .collect(),
            None => Vec::new(),
        }
    }
}

fn role_keys(prefix: &str, roles: &[(u16, &str)]) -> Vec<String> {
    roles.iter().map(|(_, role)| format!("{prefix}{role}")).collect()
}

/// Bus address stored under `key`. Zero means unassigned.
pub(crate) fn address_of(state: &ModuleState, key: &str) -> Option<u16> {
    let address = state.int(key).filter(|address| *address != 0)?;
    match u16::try_from(address) {
        Ok(address) if address <= proto::MAX_BUS_ADDRESS => Some(address),
        _ => {
            log::warn!("Ignoring {key} {address}: not a bus address");
            None
        }
    }
}

/// Subsets of relayed data produced by the trigger engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerOutput {
    pub store: Values,
    pub send: Values,
    pub event: Values,
}

/// Trigger evaluation, provided by the embedding agent.
pub trait Triggers: Send + Sync {
    fn run(&self, state: &ModuleState, data: &Values, timestamp: SystemTime) -> TriggerOutput;
}

#[derive(Debug)]
pub struct Module {
    family: Family,
    base: ParameterTable,
    blocks: Option<Arc<dyn BlockAccess>>,
    events: EventBus,
    schedule: Schedule,
    collect: BTreeMap<String, Duration>,
    settings: ModuleSettings,
    state: RwLock<ModuleState>,
    table: RwLock<ParameterTable>,
    subscription: Mutex<Option<Subscription>>,
    // Makes a block read-modify-write atomic with respect to other block access of this module.
    block_lock: Mutex<()>,
    postbox_lock: Mutex<()>,
}

impl Module {
    pub fn new(family: Family, blocks: Arc<dyn BlockAccess>, events: EventBus, schedule: Schedule) -> Self {
        Self::build(family, Some(blocks), events, schedule)
    }

    /// A module without block access, such as a controller reached directly.
    pub(crate) fn controller(family: Family, events: EventBus, schedule: Schedule) -> Self {
        Self::build(family, None, events, schedule)
    }

    fn build(family: Family, blocks: Option<Arc<dyn BlockAccess>>, events: EventBus, schedule: Schedule) -> Self {
        let base = ParameterTable::new();
        let table = build_table(family, &base, &ModuleState::new());
        Self {
            family,
            base,
            blocks,
            events,
            schedule,
            collect: BTreeMap::new(),
            settings: ModuleSettings::default(),
            state: RwLock::new(ModuleState::new()),
            table: RwLock::new(table),
            subscription: Mutex::new(None),
            block_lock: Mutex::new(()),
            postbox_lock: Mutex::new(()),
        }
    }

    /// Parameter specs shared by every module of the family. Family rules are layered on top.
    pub fn with_base_table(mut self, base: ParameterTable) -> Self {
        *self.table.get_mut() = build_table(self.family, &base, self.state.get_mut());
        self.base = base;
        self
    }

    /// Read periods registered in the schedule once the module is identified.
    pub fn with_collect(mut self, collect: BTreeMap<String, Duration>) -> Self {
        self.collect = collect;
        self
    }

    pub fn with_settings(mut self, settings: ModuleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub async fn dev_id(&self) -> Option<String> {
        self.state
            .read()
            .await
            .get(DEV_ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Snapshot of the current state.
    pub async fn current_state(&self) -> Values {
        self.state.read().await.current().clone()
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.state.read().await.get(name).cloned()
    }

    /// Read access to all state tracks.
    pub async fn state(&self) -> tokio::sync::RwLockReadGuard<'_, ModuleState> {
        self.state.read().await
    }

    /// Snapshot of the active parameter specs.
    pub async fn table(&self) -> ParameterTable {
        self.table.read().await.clone()
    }

    /// Serial number and generation the blocks of the module are addressed by.
    pub async fn identity(&self) -> Result<ModuleIdentity> {
        let state = self.state.read().await;
        let serial_number = state.int("serial_number").and_then(|v| u16::try_from(v).ok());
        let generation_id = state.int("generation_id").and_then(|v| u8::try_from(v).ok());
        match (serial_number, generation_id) {
            (Some(serial_number), Some(generation_id)) => Ok(ModuleIdentity::new(serial_number, generation_id)),
            _ => Err(Error::Unidentified),
        }
    }

    fn block_access(&self) -> Result<&Arc<dyn BlockAccess>> {
        self.blocks.as_ref().ok_or(Error::NotConnected("block"))
    }

    /// Takes on the identity announced by a roll call.
    pub async fn update_from_roll_call(&self, roll_call: &RollCall) -> Result<()> {
        let params = self.roll_call_params(roll_call)?;
        log::info!(
            "{} {} announced at address {}",
            self.family.name(),
            roll_call.dev_id(),
            roll_call.address
        );
        self.apply_identity(params).await
    }

    fn roll_call_params(&self, roll_call: &RollCall) -> Result<Values> {
        if self.family == Family::Rts {
            return Err(Error::Config(String::from(
                "RTS controllers announce through an RTS roll call",
            )));
        }
        let mut params = Values::new();
        params.insert("serial_number".into(), roll_call.serial_number.into());
        params.insert("generation_id".into(), u16::from(roll_call.generation_id).into());
        params.insert(DEV_ID_KEY.into(), roll_call.dev_id().into());
        if self.family.is_multi_role() {
            let role = self.family.role(roll_call.module_type).ok_or_else(|| {
                Error::Config(format!(
                    "Module type {} is not a role of {}",
                    roll_call.module_type,
                    self.family.name()
                ))
            })?;
            params.insert(format!("address-{role}"), roll_call.address.into());
            params.insert(format!("module_type-{role}"), roll_call.module_type.into());
            if role == "flags" {
                params.insert("address".into(), roll_call.address.into());
            }
            if self.family == Family::GasGuard2 && role == "power" {
                params.insert("detector-type".into(), roll_call.version.into());
            }
        } else {
            params.insert("address-single".into(), roll_call.address.into());
            params.insert("module_type".into(), roll_call.module_type.into());
            params.insert("version".into(), roll_call.version.into());
            params.insert(
                "software_version".into(),
                proto::software_version(roll_call.version).into(),
            );
            params.insert(
                "hardware_version".into(),
                proto::hardware_version(roll_call.version).into(),
            );
        }
        Ok(params)
    }

    /// Replaces the identity keys of the state and rebuilds everything keyed by `dev_id`.
    ///
    /// A different `dev_id` is a new module: the state is reset, the schedule
    /// entries of the old one are removed and the subscription is replaced.
    pub(crate) async fn apply_identity(&self, params: Values) -> Result<()> {
        let dev_id = params
            .get(DEV_ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(Error::Unidentified)?;
        let previous = {
            let mut state = self.state.write().await;
            let previous = state.get(DEV_ID_KEY).and_then(Value::as_str).map(str::to_string);
            if previous.as_ref().is_some_and(|previous| *previous != dev_id) {
                state.reset();
            }
            state.update_current(&params);
            previous
        };
        self.events.publish_module_data(&dev_id, params, SystemTime::now());
        self.update_specs().await;

        if previous.as_deref() != Some(dev_id.as_str()) {
            if let Some(previous) = &previous {
                log::info!("{previous} superseded by {dev_id}");
                self.schedule.remove_device(previous).await;
            }
            for (param, period) in &self.collect {
                self.schedule.register(&dev_id, param, *period).await;
            }
            let fields = self.family.trigger_fields();
            let subscription = Subscription::new(&self.events, &dev_id, fields.iter().map(String::as_str));
            *self.subscription.lock().await = Some(subscription);
        }
        Ok(())
    }

    /// Recomputes the active parameter specs from the current state.
    pub async fn update_specs(&self) {
        let table = {
            let state = self.state.read().await;
            build_table(self.family, &self.base, &state)
        };
        log::debug!("{} specs updated, {} parameters", self.family.name(), table.names().len());
        *self.table.write().await = table;
    }

    /// Addresses the module occupies on the bus.
    pub async fn identify_addresses(&self) -> Values {
        let state = self.state.read().await;
        let keys: Vec<String> = match self.family {
            Family::Aim | Family::Rtd1 | Family::GasGuard2 => role_keys("address-", self.family.roles()),
            Family::Rts => crate::identity::RTS_SCHEMAS
                .iter()
                .map(|schema| format!("address-{schema}"))
                .collect(),
            _ => vec!["address-single".into()],
        };
        let mut addresses = state.subset(&keys);
        if self.family == Family::SimP {
            let table = self.table.read().await;
            for spec in table.poll_specs() {
                for key in spec.keys().into_iter().filter(|key| key.starts_with("raw-word")) {
                    if let Some(address) = spec.addresses().first() {
                        addresses.insert(key.to_string(), (*address).into());
                    }
                }
            }
        }
        addresses
    }

    async fn read_block(&self, identity: ModuleIdentity, block: u16) -> Result<AddressMap> {
        let blocks = self.block_access()?;
        let _guard = self.block_lock.lock().await;
        blocks.read_block(identity, block).await
    }

    async fn decode_block(&self, block: u16, map: &AddressMap) -> Values {
        let table = self.table.read().await;
        let mut values = Values::new();
        for spec in table.block_specs(block) {
            values.extend(spec.decode(map));
        }
        values
    }

    /// Reads every block holding one of `names`. A failed block is logged and left out.
    pub async fn parameter_block_reader(&self, names: &BTreeSet<String>) -> Values {
        let blocks = self.table.read().await.dispatch(names).blocks;
        let mut parameters = Values::new();
        if blocks.is_empty() {
            return parameters;
        }
        let identity = match self.identity().await {
            Ok(identity) => identity,
            Err(err) => {
                log::error!("Cannot read blocks of {} module: {err}", self.family.name());
                return parameters;
            }
        };
        for block in blocks {
            match self.read_block(identity, block).await {
                Ok(map) => parameters.extend(self.decode_block(block, &map).await),
                Err(err) => log::error!("Failed to read {}: block {block}: {err}", identity.dev_id()),
            }
        }
        parameters
    }

    /// Poll parameters are kept current by the poll pipeline; this returns the cached values.
    pub async fn parameter_poll_reader(&self, names: &BTreeSet<String>) -> Values {
        let poll = self.table.read().await.dispatch(names).poll;
        self.state.read().await.subset(&poll)
    }

    /// Reads postbox parameters one at a time under the postbox lock.
    pub async fn parameter_postbox_reader(&self, names: &BTreeSet<String>) -> Values {
        let requests = self.table.read().await.dispatch(names).postbox;
        let mut parameters = Values::new();
        if requests.is_empty() {
            return parameters;
        }
        let identity = match self.identity().await {
            Ok(identity) => identity,
            Err(err) => {
                log::error!("Cannot read postbox of {} module: {err}", self.family.name());
                return parameters;
            }
        };
        for (name, code) in requests {
            let _postbox = self.postbox_lock.lock().await;
            match self.postbox_transaction(identity, code).await {
                Ok(mut values) => match values.get(POSTBOX_TIMESTAMP).cloned() {
                    Some(timestamp) => {
                        values.insert(name, timestamp);
                        parameters.extend(values);
                    }
                    None => log::error!("Failed to read {}: {name}: no {POSTBOX_TIMESTAMP}", identity.dev_id()),
                },
                Err(err) => log::error!("Failed to read {}: {name}: {err}", identity.dev_id()),
            }
        }
        parameters
    }

    async fn postbox_transaction(&self, identity: ModuleIdentity, code: u16) -> Result<Values> {
        let mut selection = Values::new();
        selection.insert(POSTBOX_SELECTION.into(), code.into());
        self.write_values(identity, &selection, true).await?;
        tokio::time::sleep(self.settings.postbox_settle).await;
        let block = self
            .table
            .read()
            .await
            .block_of(POSTBOX_TIMESTAMP)
            .ok_or_else(|| Error::Config(format!("{} has no {POSTBOX_TIMESTAMP}", self.family.name())))?;
        let map = self.read_block(identity, block).await?;
        Ok(self.decode_block(block, &map).await)
    }

    /// Reads `names` through their handlers and folds the result into the state.
    ///
    /// Names that were read are rescheduled by their own period, names that
    /// were requested but not read are cooled down. Only the freshly read
    /// values are published.
    pub async fn read_parameters(&self, names: &BTreeSet<String>) -> Result<Values> {
        let dev_id = self.dev_id().await.ok_or(Error::Unidentified)?;
        let (block, poll, postbox) = tokio::join!(
            self.parameter_block_reader(names),
            self.parameter_poll_reader(names),
            self.parameter_postbox_reader(names),
        );
        let mut parameters = block;
        parameters.extend(poll);
        parameters.extend(postbox);

        let timestamp = SystemTime::now();
        let (read, failed): (Vec<&String>, Vec<&String>) =
            names.iter().partition(|name| parameters.contains_key(*name));
        if !failed.is_empty() {
            log::debug!("{dev_id}: {} parameters unavailable this cycle", failed.len());
        }
        self.schedule
            .reschedule_by_period(&dev_id, read.iter().copied(), timestamp)
            .await;
        self.schedule
            .reschedule_after(
                &dev_id,
                failed.iter().copied(),
                timestamp,
                self.settings.failed_read_cooldown,
            )
            .await;
        {
            let mut state = self.state.write().await;
            state.update_read(read.iter().copied(), timestamp);
            state.update_current(&parameters);
        }
        self.events.publish_module_data(&dev_id, parameters.clone(), timestamp);
        Ok(parameters)
    }

    /// Writes block parameters read-modify-write and verifies them by reading back.
    pub async fn write_parameters(&self, values: &Values) -> Result<()> {
        let identity = self.identity().await?;
        self.write_values(identity, values, true).await
    }

    /// Writes block parameters read-modify-write without waiting for confirmation.
    pub async fn write_parameters_no_check(&self, values: &Values) -> Result<()> {
        let identity = self.identity().await?;
        self.write_values(identity, values, false).await
    }

    async fn write_values(&self, identity: ModuleIdentity, values: &Values, check: bool) -> Result<()> {
        let dispatch = self.table.read().await.dispatch(values.keys());
        if !dispatch.poll.is_empty() || !dispatch.postbox.is_empty() || !dispatch.unknown.is_empty() {
            let postbox: Vec<&str> = dispatch.postbox.iter().map(|(name, _)| name.as_str()).collect();
            log::warn!(
                "{}: ignoring writes to poll {:?} postbox {:?} unknown {:?}",
                identity.dev_id(),
                dispatch.poll,
                postbox,
                dispatch.unknown
            );
        }
        let blocks = self.block_access()?;
        for block in dispatch.blocks {
            let _guard = self.block_lock.lock().await;
            let mut image = blocks.read_block(identity, block).await?;
            let specs: Vec<Arc<dyn ParamSpec>> = self.table.read().await.block_specs(block).cloned().collect();
            for spec in &specs {
                spec.encode(values, &mut image)?;
            }
            if !check {
                blocks.write_block_no_check(identity, block, &image).await?;
                continue;
            }
            blocks.write_block(identity, block, &image).await?;
            let readback = blocks.read_block(identity, block).await?;
            for spec in &specs {
                let written = written_subset(spec.as_ref(), &image, values);
                if !written.is_empty() && written != written_subset(spec.as_ref(), &readback, values) {
                    return Err(Error::WriteVerification(format!(
                        "block {block} of {}",
                        identity.dev_id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decodes the poll specs of a snapshot. A spec below the status window is
    /// only trusted when the status register of its address says online.
    pub async fn process_module_data(&self, map: AddressMap) -> Values {
        let table = self.table.read().await.clone();
        match tokio::task::spawn_blocking(move || decode_poll(&table, &map)).await {
            Ok(values) => values,
            Err(err) => {
                log::error!("Poll decode of {} failed: {err}", self.family.name());
                Values::new()
            }
        }
    }

    /// Folds a poll result into the state and publishes it.
    pub(crate) async fn apply_poll(&self, values: Values, timestamp: SystemTime) -> Result<()> {
        let dev_id = self.dev_id().await.ok_or(Error::Unidentified)?;
        {
            let mut state = self.state.write().await;
            state.update_read(values.keys(), timestamp);
            state.update_current(&values);
        }
        self.events.publish_module_data(&dev_id, values, timestamp);
        Ok(())
    }

    /// Runs the triggers against `data`, records what was relayed and fans out event fields.
    pub async fn relay(&self, triggers: &dyn Triggers, data: &Values, timestamp: SystemTime) -> Result<TriggerOutput> {
        let dev_id = self.dev_id().await.ok_or(Error::Unidentified)?;
        let output = {
            let mut state = self.state.write().await;
            let output = triggers.run(&state, data, timestamp);
            state.update_store(&output.store);
            state.update_send(&output.send);
            state.update_event(&output.event);
            output
        };
        for (field, value) in &output.event {
            let mut values = Values::new();
            values.insert(field.clone(), value.clone());
            let mut data = EventData::new();
            data.insert(dev_id.clone(), values);
            self.events
                .publish(proto::parameter_trigger_topic(&dev_id, field), data, timestamp);
        }
        Ok(output)
    }

    /// Handles events queued on the module's subscription. Returns the derived values published.
    pub async fn poll_subscription(&self) -> Values {
        let events = match self.subscription.lock().await.as_mut() {
            Some(subscription) => subscription.drain(),
            None => return Values::new(),
        };
        let mut derived = Values::new();
        for event in &events {
            derived.extend(self.handle_event(event).await);
        }
        derived
    }

    /// Recomputes the IO feedback of DI4/RO4 modules when a raw or invert field triggers.
    pub async fn handle_event(&self, event: &Event) -> Values {
        let Some((raw_prefix, derived_prefix)) = self.family.feedback() else {
            return Values::new();
        };
        let Some(dev_id) = self.dev_id().await else {
            return Values::new();
        };
        if !event.topic.starts_with(proto::PARAMETER_TRIGGER_TOPIC) {
            return Values::new();
        }
        let mut current = self.state.read().await.current().clone();
        if let Some(values) = event.values_for(&dev_id) {
            current.extend(values.clone());
        }
        let flag = |key: String| current.get(&key).and_then(Value::as_bool);
        let mut feedback = Values::new();
        for n in 1..=4 {
            let (Some(raw), Some(invert)) = (flag(format!("{raw_prefix}{n}")), flag(format!("invert-status-{n}"))) else {
                return Values::new();
            };
            feedback.insert(format!("{derived_prefix}{n}"), Value::Bool(raw ^ invert));
        }
        self.events
            .publish_module_data(&dev_id, feedback.clone(), event.timestamp);
        feedback
    }

    /// Reads the family's starting parameters that are still unknown.
    ///
    /// The data is advisory: failures are logged and the attempt given up.
    pub async fn find_missing_starting_data(&self) -> Values {
        let missing: BTreeSet<String> = {
            let state = self.state.read().await;
            self.family
                .starting_parameters()
                .into_iter()
                .filter(|name| state.get(name).is_none())
                .collect()
        };
        let mut parameters = Values::new();
        if missing.is_empty() {
            return parameters;
        }
        for attempt in 1..=self.settings.starting_data_attempts {
            match self.read_parameters(&missing).await {
                Ok(read) if !read.is_empty() => {
                    parameters = read;
                    break;
                }
                Ok(_) => log::warn!(
                    "Failed to read {} starting parameters, attempt {attempt}",
                    self.family.name()
                ),
                Err(err) => {
                    log::warn!("Failed to read {} starting parameters: {err}", self.family.name());
                    break;
                }
            }
        }
        self.update_specs().await;
        parameters
    }

    /// Releases the module: its schedule entries and subscription are dropped.
    ///
    /// A GasGuard2 first gives its sub-addresses back by zeroing them.
    pub async fn disconnect(&self) -> Result<()> {
        let dev_id = self.dev_id().await.ok_or(Error::Unidentified)?;
        let mut result = Ok(());
        if self.family == Family::GasGuard2 {
            let reset: Values = {
                let state = self.state.read().await;
                self.family
                    .starting_parameters()
                    .into_iter()
                    .filter(|key| state.int(key).is_some_and(|address| address != 0))
                    .map(|key| (key, Value::Int(0)))
                    .collect()
            };
            if !reset.is_empty() {
                log::info!("Releasing {} addresses of {dev_id}", reset.len());
                result = self.write_parameters(&reset).await;
                if result.is_ok() {
                    let names: BTreeSet<String> = reset.into_keys().collect();
                    result = self.read_parameters(&names).await.map(|_| ());
                }
            }
        }
        self.schedule.remove_device(&dev_id).await;
        *self.subscription.lock().await = None;
        result
    }
}

fn written_subset(spec: &dyn ParamSpec, map: &AddressMap, values: &Values) -> Values {
    spec.decode(map)
        .into_iter()
        .filter(|(key, _)| values.contains_key(key))
        .collect()
}

/// Decodes the poll specs whose registers are trustworthy in `map`.
pub fn decode_poll(table: &ParameterTable, map: &AddressMap) -> Values {
    let mut values = Values::new();
    for spec in table.poll_specs() {
        let live = spec.addresses().into_iter().any(|address| {
            address > proto::STATUS_OFFSET
                || map
                    .get(address + proto::STATUS_OFFSET)
                    .is_ok_and(|status| ModuleStatus::decode(status).is_live())
        });
        if live {
            values.extend(spec.decode(map));
        }
    }
    values
}

/// Active specs of a family for a given state.
fn build_table(family: Family, base: &ParameterTable, state: &ModuleState) -> ParameterTable {
    let mut table = base.clone();
    match family {
        Family::SimP => simp_specs(&mut table, state),
        Family::Rtd1 => rtd1_specs(&mut table, state),
        Family::GasGuard2 => gasguard2_specs(&mut table, state),
        Family::Rts => crate::rts::poll_specs(&mut table, state),
        Family::Generic | Family::Lim | Family::Di4 | Family::Ro4 | Family::Aim => {}
    }
    table
}

fn simp_specs(table: &mut ParameterTable, state: &ModuleState) {
    table
        .insert_block(0, param(0x40F, "modbus-slave-address"))
        .insert_block(0, param(0x410, "modbus-start-address"))
        .insert_block(0, param(0x411, "modbus-register-count"));
    let Some(address) = address_of(state, "address-single") else {
        return;
    };
    table
        .insert_poll(ParamMaskBool::new(address, "comms-error", 1 << 15))
        .insert_poll(ParamMask::new(address, "comms-error-count", 0x7FFF, 0));
    let count = state
        .int("modbus-register-count")
        .and_then(|count| u16::try_from(count).ok())
        .unwrap_or(0);
    for x in 0..count {
        if let Some(word) = address.checked_add(x + 1) {
            table.insert_poll(param(word, format!("raw-word-{x}")));
        }
    }
}

fn rtd1_specs(table: &mut ParameterTable, state: &ModuleState) {
    table
        .insert_block(0, param(0x40E, "address-flags"))
        .insert_block(0, param(0x411, "voltage-l1").scale(0.1))
        .insert_block(1, param(0x40E, "address-temp"))
        .insert_block(1, ParamCType::new(0x40F, "set-point-low", CType::Short))
        .insert_block(1, ParamCType::new(0x411, "set-point-high", CType::Short));
    if let Some(address) = address_of(state, "address-flags") {
        table.insert_poll(ParamBits::new(
            address,
            [
                ("alarm-temp-high", 5),
                ("alarm-temp-low", 4),
                ("alarm-temp-out-of-range", 3),
                ("rtd-sense-wire-fault", 2),
                ("rtd-open-circuit", 1),
                ("rtd-short-circuit", 0),
            ],
        ));
    }
    if let Some(address) = address_of(state, "address-temp") {
        table.insert_poll(ParamCType::new(address, "temperature", CType::Short));
    }
}

const GASGUARD2_FLAGS: [(&str, u8); 15] = [
    ("telemetry-test", 14),
    ("hardware-fault", 13),
    ("ch4-over-range-ndir-incomplete-calibration", 12),
    ("linearity-test-overdue", 11),
    ("detector-warm-up-busy", 10),
    ("gas-value-invalid", 9),
    ("cal-cup-on", 8),
    ("detector-data-invalid", 7),
    ("power-alarm-trip", 6),
    ("power-alarm-warn", 5),
    ("set-point-2-not-3", 4),
    ("set-point-not-1-not-2", 3),
    ("set-point-alarm-3", 2),
    ("set-point-alarm-2", 1),
    ("set-point-alarm-1", 0),
];

const TRIP_STATUS_MASK: u16 = 0b0011_1110_1100_0101;

const STATUS_BITS: [(&str, u8); 15] = [
    ("on-scan-bit", 0),
    ("l1-clash-bit", 1),
    ("global-bit", 2),
    ("l1-own-bit", 3),
    ("l2-own-bit", 4),
    ("sys-own-bit", 5),
    ("l2-clash-bit", 6),
    ("high-byte-bit", 7),
    ("valid-offline", 8),
    ("valid-online", 9),
    ("valid-iso-request", 10),
    ("iso-req-filter", 12),
    ("iso-here", 13),
    ("iso-there", 14),
    ("iso-neither", 15),
];

/// Status, resistance and error count registers that shadow a bus address.
pub(crate) fn diagnostic_specs(table: &mut ParameterTable, suffix: &str, address: u16) {
    table
        .insert_poll(param(address + proto::RESISTANCE_OFFSET, format!("resistance-{suffix}")))
        .insert_poll(ParamMask::new(
            address + proto::ERROR_COUNT_OFFSET,
            format!("error-offline-count-{suffix}"),
            0xFF,
            0,
        ))
        .insert_poll(ParamMask::new(
            address + proto::ERROR_COUNT_OFFSET,
            format!("error-clashes-count-{suffix}"),
            0xFF00,
            8,
        ));
}

fn gasguard2_specs(table: &mut ParameterTable, state: &ModuleState) {
    table
        .insert_block(0, param(0x40E, "address-flags"))
        .insert_block(0, param(0x40F, "exception-trigger"))
        .insert_block(0, ParamMask::new(0x411, "address-bypass", 0xFF, 0))
        .insert_block(0, ParamMask::new(0x411, "aim-compatibility-mode", 0x100, 8))
        .insert_block(1, param(0x40E, "address-analog"))
        .insert_block(1, param(0x40F, "set-point-1"))
        .insert_block(1, param(0x410, "set-point-2"))
        .insert_block(1, param(0x411, "set-point-3"))
        .insert_block(2, param(0x40E, "address-power"))
        .insert_block(2, ParamMask::new(0x411, "hysteresis-config", 0b1111 << 12, 12))
        .insert_block(2, ParamMask::new(0x411, "healthy-config", 0b111 << 9, 9))
        .insert_block(2, ParamMaskBool::new(0x411, "warmup-config", 1 << 8))
        .insert_block(2, ParamMask::new(0x411, "address-rtc", 0xFF, 0))
        .insert_block(3, param(0x40E, "detector-temperature"))
        .insert_block(3, param(0x40F, "detector-pressure"))
        .insert_block(3, param(0x410, "detector-humidity"))
        .insert_block(3, ParamMask::new(0x411, "command-register-code", 0xFF00, 8))
        .insert_block(3, ParamMask::new(0x411, "command-register-result", 0xFF, 0))
        .insert_block(4, param(0x40E, "last-t90-test-result"))
        .insert_block(4, param(0x40F, "last-nata-cal-hours"))
        .insert_block(4, param(0x410, "last-cal-cup-seconds"))
        .insert_block(
            4,
            ParamMask::new(0x411, "power-supply-voltage", 0xFF00, 8)
                .scale(0.1)
                .significant_figures(3),
        )
        .insert_block(5, ParamMask::new(0x40E, POSTBOX_SELECTION, 0b111, 0))
        .insert_block(5, ParamMask::new(0x40F, "detector-type", 0xFF00, 8))
        .insert_block(5, ParamMaskBool::new(0x40F, "cal-cup-alarm-28-days", 1 << 4))
        .insert_block(5, ParamMaskBool::new(0x40F, "linearity-test-alarm-14-days", 1 << 3))
        .insert_block(5, ParamMask::new(0x40E, "linearity-test-last-points", 0b111, 0))
        .insert_block(5, ParamCType::new(0x410, POSTBOX_TIMESTAMP, CType::UInt))
        .insert_block(6, ParamCType::new(0x40F, "detector-serial-number", CType::UInt))
        .insert_block(6, param(0x411, "detector-software-version"))
        .insert_block(7, ParamCType::new(0x40E, "display-serial-number", CType::UInt))
        .insert_block(7, ParamMask::new(0x410, "display-base-software-version", 0xFF, 0))
        .insert_block(7, ParamMask::new(0x411, "display-application-version-lua", 0xFF, 0));

    if state.flag("aim-compatibility-mode").unwrap_or(false) {
        table
            .insert_block(2, param(0x40F, "power-point-alarm").scale(0.01).significant_figures(4))
            .insert_block(2, param(0x410, "power-point-trip").scale(0.01).significant_figures(4));
    } else {
        table
            .insert_block(
                2,
                ParamMask::new(0x410, "power-point-alarm", 0xFF00, 8)
                    .scale(0.1)
                    .significant_figures(3),
            )
            .insert_block(
                2,
                ParamMask::new(0x410, "power-point-trip", 0xFF, 0)
                    .scale(0.1)
                    .significant_figures(3),
            );
    }

    for (_, role) in GASGUARD2_ROLES {
        let Some(address) = address_of(state, &format!("address-{role}")) else {
            continue;
        };
        if role == "flags" {
            table
                .insert_poll(ParamBits::new(address, GASGUARD2_FLAGS))
                .insert_poll(ParamMaskBool::new(address, "trip-status", TRIP_STATUS_MASK));
        } else {
            table.insert_poll(param(address, format!("data-{role}")));
        }
        table.insert_poll(ParamBits::new(
            address + proto::STATUS_OFFSET,
            STATUS_BITS
                .iter()
                .map(|(name, bit)| (format!("status-{role}-{name}"), *bit)),
        ));
        diagnostic_specs(table, role, address);
    }

    if let Some(address) = address_of(state, "address-bypass") {
        table.insert_poll(ParamBits::new(address, [("bypass-remote", 8), ("bypass-local", 0)]));
    }

    table
        .insert_postbox("linearity-test-time", 0b00)
        .insert_postbox("telemetry-test-time", 0b01)
        .insert_postbox("t90-test-time", 0b10)
        .insert_postbox("rtc-time", 0b11);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn image(params: [u16; 4]) -> AddressMap {
        let mut map = AddressMap::from_registers(proto::ROLL_CALL_REG_ADDR, &[0; 5]);
        map.set_range(proto::BLOCK_PARAM_REG_ADDR, &params);
        map
    }

    /// Block store keyed by block number. Writing a postbox selection to block 5
    /// moves `1000 + code` into the postbox timestamp.
    #[derive(Debug, Default)]
    struct MockBlocks {
        blocks: StdMutex<HashMap<u16, AddressMap>>,
        failing: StdMutex<BTreeSet<u16>>,
        log: StdMutex<Vec<String>>,
        write_delay: Option<Duration>,
    }

    impl MockBlocks {
        fn with_block(self, block: u16, params: [u16; 4]) -> Self {
            self.blocks.lock().unwrap().insert(block, image(params));
            self
        }

        fn fail(&self, block: u16) {
            self.failing.lock().unwrap().insert(block);
        }

        fn params(&self, block: u16) -> Vec<u16> {
            self.blocks.lock().unwrap()[&block].get_range(0x40E..0x412).unwrap()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        async fn store(&self, block: u16, image: &AddressMap) -> Result<()> {
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().unwrap().push(format!("write {block}"));
            let mut image = image.clone();
            if block == 5 {
                let code = image.get(0x40E)? & 0b111;
                image.set_range(0x410, &[0, 1000 + code]);
            }
            self.blocks.lock().unwrap().insert(block, image);
            Ok(())
        }
    }

    #[async_trait]
    impl BlockAccess for MockBlocks {
        async fn read_block(&self, _identity: ModuleIdentity, block: u16) -> Result<AddressMap> {
            self.log.lock().unwrap().push(format!("read {block}"));
            if self.failing.lock().unwrap().contains(&block) {
                return Err(Error::io(std::io::ErrorKind::TimedOut, "no answer"));
            }
            self.blocks
                .lock()
                .unwrap()
                .get(&block)
                .cloned()
                .ok_or(Error::BitCheck {
                    register: proto::ROLL_CALL_REG_ADDR,
                    bit: proto::READ_SERIAL_NUMBER_FAIL_BIT,
                    expected: false,
                })
        }

        async fn write_block(&self, _identity: ModuleIdentity, block: u16, image: &AddressMap) -> Result<()> {
            self.store(block, image).await
        }

        async fn write_block_no_check(&self, _identity: ModuleIdentity, block: u16, image: &AddressMap) -> Result<()> {
            self.store(block, image).await
        }
    }

    fn roll_call(serial_number: u16, generation_id: u8, module_type: u16, address: u16) -> RollCall {
        RollCall {
            serial_number,
            generation_id,
            address,
            version: 0x3A,
            module_type,
        }
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn gasguard2(blocks: MockBlocks) -> (Arc<MockBlocks>, Module) {
        let blocks = Arc::new(blocks);
        let collect = BTreeMap::from([
            ("set-point-1".to_string(), Duration::from_secs(60)),
            ("exception-trigger".to_string(), Duration::from_secs(30)),
        ]);
        let module = Module::new(Family::GasGuard2, blocks.clone(), EventBus::new(), Schedule::new())
            .with_collect(collect);
        (blocks, module)
    }

    #[test]
    fn families() {
        assert_eq!(Family::from_module_type(7), Family::Lim);
        assert_eq!(Family::from_module_type(15), Family::Di4);
        assert_eq!(Family::from_module_type(40), Family::Ro4);
        assert_eq!(Family::from_module_type(49), Family::Aim);
        assert_eq!(Family::from_module_type(55), Family::Rtd1);
        assert_eq!(Family::from_module_type(63), Family::GasGuard2);
        assert_eq!(Family::from_module_type(36), Family::Generic);
        assert_eq!(Family::from_module_type(200), Family::Generic);
        assert_eq!(Family::GasGuard2.role(62), Some("analog"));
        assert_eq!(Family::GasGuard2.role(48), None);
        assert!(!Family::Di4.is_multi_role());
        assert_eq!(Family::Di4.trigger_fields().len(), 8);
    }

    #[tokio::test]
    async fn generic_roll_call() {
        let module = Module::new(Family::Generic, Arc::new(MockBlocks::default()), EventBus::new(), Schedule::new());
        let mut rx = module.events().subscribe();
        assert_matches!(module.identity().await, Err(Error::Unidentified));
        module.update_from_roll_call(&roll_call(1000, 0, 36, 17)).await.unwrap();

        assert_eq!(module.dev_id().await.as_deref(), Some("1000-G1"));
        assert_eq!(module.identity().await.unwrap(), ModuleIdentity::new(1000, 0));
        assert_eq!(module.get("address-single").await, Some(Value::Int(17)));
        assert_eq!(module.get("software_version").await, Some(Value::Int(0)));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.values_for("1000-G1").unwrap()["module_type"], Value::Int(36));
        assert_eq!(
            module.identify_addresses().await,
            Values::from([("address-single".to_string(), Value::Int(17))])
        );
    }

    #[tokio::test]
    async fn multi_role_roll_call() {
        let (_, module) = gasguard2(MockBlocks::default());
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        module.update_from_roll_call(&roll_call(1000, 0, 63, 7)).await.unwrap();
        let state = module.current_state().await;
        assert_eq!(state["address-flags"], Value::Int(5));
        assert_eq!(state["address"], Value::Int(5));
        assert_eq!(state["address-power"], Value::Int(7));
        assert_eq!(state["detector-type"], Value::Int(0x3A));
        assert!(!state.contains_key("address-analog"));
        assert_matches!(
            module.update_from_roll_call(&roll_call(1000, 0, 48, 9)).await,
            Err(Error::Config(_))
        );

        let table = module.table().await;
        assert!(table.kind("data-power").is_some());
        assert!(table.kind("status-flags-on-scan-bit").is_some());
        assert!(table.kind("resistance-power").is_some());
        assert!(table.kind("data-analog").is_none());
    }

    #[tokio::test]
    async fn new_generation_is_new_module() {
        let (_, module) = gasguard2(MockBlocks::default().with_block(1, [0, 10, 20, 30]));
        let schedule = module.schedule().clone();
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        module.read_parameters(&names(&["set-point-1"])).await.unwrap();
        assert!(schedule.get_by_key("1000-G1::set-point-1").await.is_some());
        assert_eq!(module.get("set-point-1").await, Some(Value::Int(10)));

        module.update_from_roll_call(&roll_call(1000, 1, 61, 5)).await.unwrap();
        assert_eq!(module.dev_id().await.as_deref(), Some("1000-G2"));
        assert!(schedule.get_by_key("1000-G1::set-point-1").await.is_none());
        let entry = schedule.get_by_key("1000-G2::set-point-1").await.unwrap();
        assert_eq!(entry.time_delta, Duration::from_secs(60));
        assert_eq!(module.get("set-point-1").await, None);
        assert_eq!(schedule.len().await, 2);

        // Re-announcing the same identity keeps the state and the schedule
        module.read_parameters(&names(&["set-point-1"])).await.unwrap();
        module.update_from_roll_call(&roll_call(1000, 1, 61, 5)).await.unwrap();
        assert_eq!(module.get("set-point-1").await, Some(Value::Int(10)));
        assert_eq!(schedule.len().await, 2);
    }

    #[tokio::test]
    async fn failed_block_is_isolated_and_cooled_down() {
        let (blocks, module) = gasguard2(
            MockBlocks::default()
                .with_block(0, [5, 99, 0, 0])
                .with_block(1, [6, 10, 20, 30]),
        );
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        blocks.fail(0);

        let before = SystemTime::now();
        let read = module
            .read_parameters(&names(&["set-point-1", "exception-trigger"]))
            .await
            .unwrap();
        assert_eq!(read["set-point-1"], Value::Int(10));
        assert_eq!(read["set-point-3"], Value::Int(30));
        assert!(!read.contains_key("exception-trigger"));
        assert_eq!(module.get("exception-trigger").await, None);

        let schedule = module.schedule();
        let ok = schedule.get("1000-G1", "set-point-1").await.unwrap();
        let failed = schedule.get("1000-G1", "exception-trigger").await.unwrap();
        let within = |deadline: SystemTime, delay: u64| {
            let offset = deadline.duration_since(before).unwrap();
            offset >= Duration::from_secs(delay) && offset < Duration::from_secs(delay + 5)
        };
        assert!(within(ok.deadline, 60));
        assert!(within(failed.deadline, 600));
        assert!(module.state().await.last_read("set-point-1").is_some());
        assert!(module.state().await.last_read("exception-trigger").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn block_and_postbox_in_one_call() {
        let (blocks, module) = gasguard2(
            MockBlocks::default()
                .with_block(1, [6, 10, 20, 30])
                .with_block(5, [0, 0x0300, 0, 0]),
        );
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        let read = module
            .read_parameters(&names(&["set-point-2", "rtc-time"]))
            .await
            .unwrap();
        assert_eq!(read["set-point-2"], Value::Int(20));
        assert_eq!(read["rtc-time"], Value::Int(1003));
        assert_eq!(read[POSTBOX_TIMESTAMP], Value::Int(1003));
        assert_eq!(read["detector-type"], Value::Int(3));

        // The block read is done while the postbox settles
        let log = blocks.log();
        let block_read = log.iter().position(|entry| entry == "read 1").unwrap();
        let postbox_read = log.iter().rposition(|entry| entry == "read 5").unwrap();
        assert!(block_read < postbox_read);
    }

    #[tokio::test(start_paused = true)]
    async fn postbox_transactions_do_not_interleave() {
        let mut blocks = MockBlocks::default().with_block(5, [0; 4]);
        blocks.write_delay = Some(Duration::from_millis(300));
        let (_, module) = gasguard2(blocks);
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();

        let linearity = names(&["linearity-test-time"]);
        let t90 = names(&["t90-test-time"]);
        let telemetry = names(&["telemetry-test-time", "rtc-time"]);
        let (a, b, c) = tokio::join!(
            module.parameter_postbox_reader(&linearity),
            module.parameter_postbox_reader(&t90),
            module.parameter_postbox_reader(&telemetry),
        );
        assert_eq!(a["linearity-test-time"], Value::Int(1000));
        assert_eq!(b["t90-test-time"], Value::Int(1002));
        assert_eq!(c["telemetry-test-time"], Value::Int(1001));
        assert_eq!(c["rtc-time"], Value::Int(1003));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_postbox_is_left_out() {
        let (blocks, module) = gasguard2(MockBlocks::default().with_block(1, [6, 10, 20, 30]));
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        let read = module
            .read_parameters(&names(&["rtc-time", "set-point-1"]))
            .await
            .unwrap();
        assert!(!read.contains_key("rtc-time"));
        assert_eq!(read["set-point-1"], Value::Int(10));
        assert!(!blocks.log().contains(&"write 5".to_string()));
    }

    #[tokio::test]
    async fn write_keeps_neighbouring_bits() {
        let (blocks, module) = gasguard2(MockBlocks::default().with_block(0, [5, 0, 0, 0x0105]));
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        let values = Values::from([("address-bypass".to_string(), Value::Int(7))]);
        module.write_parameters(&values).await.unwrap();
        assert_eq!(blocks.params(0), vec![5, 0, 0, 0x0107]);
        assert_eq!(blocks.log(), vec!["read 0", "write 0", "read 0"]);

        let values = Values::from([("exception-trigger".to_string(), Value::Int(2))]);
        module.write_parameters_no_check(&values).await.unwrap();
        assert_eq!(blocks.params(0), vec![5, 2, 0, 0x0107]);

        let log_len = blocks.log().len();
        let values = Values::from([("rtc-time".to_string(), Value::Int(5))]);
        module.write_parameters(&values).await.unwrap();
        assert_eq!(blocks.log().len(), log_len);

        let values = Values::from([("set-point-1".to_string(), Value::Text("high".into()))]);
        blocks.blocks.lock().unwrap().insert(1, image([0; 4]));
        assert_matches!(module.write_parameters(&values).await, Err(Error::Encode { .. }));
    }

    #[tokio::test]
    async fn power_point_layout_follows_compatibility_mode() {
        let (_, module) = gasguard2(
            MockBlocks::default()
                .with_block(0, [5, 0, 0, 0x0100])
                .with_block(2, [7, 2000, 0x1E0F, 0]),
        );
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        let points = names(&["power-point-alarm", "power-point-trip"]);
        let read = module.read_parameters(&points).await.unwrap();
        assert_eq!(read["power-point-alarm"], Value::Float(3.0));
        assert_eq!(read["power-point-trip"], Value::Float(1.5));

        module.read_parameters(&names(&["aim-compatibility-mode"])).await.unwrap();
        module.update_specs().await;
        let read = module.read_parameters(&points).await.unwrap();
        assert_eq!(read["power-point-alarm"], Value::Float(20.0));
        assert_eq!(read["power-point-trip"], Value::Float(76.95));
    }

    #[tokio::test]
    async fn addresses_beyond_the_bus_build_no_specs() {
        let (_, module) = gasguard2(
            MockBlocks::default()
                .with_block(0, [0xFF00, 0, 0, 0])
                .with_block(2, [0xFF, 0, 0, 0]),
        );
        module.update_from_roll_call(&roll_call(1000, 0, 62, 6)).await.unwrap();
        module
            .read_parameters(&names(&["address-flags", "address-power"]))
            .await
            .unwrap();
        assert_eq!(module.get("address-flags").await, Some(Value::Int(0xFF00)));

        module.update_specs().await;
        let table = module.table().await;
        assert!(table.kind("trip-status").is_none());
        assert!(table.kind("resistance-flags").is_none());
        assert!(table.kind("resistance-analog").is_some());
        let resistance = table
            .poll_specs()
            .find(|spec| spec.has_key("resistance-power"))
            .unwrap();
        assert_eq!(resistance.addresses(), vec![0x2FF]);
    }

    #[tokio::test]
    async fn update_specs_is_idempotent() {
        let (_, module) = gasguard2(MockBlocks::default());
        module.update_from_roll_call(&roll_call(1000, 0, 62, 6)).await.unwrap();
        let first = module.table().await.fingerprint();
        module.update_specs().await;
        assert_eq!(module.table().await.fingerprint(), first);
        module.update_specs().await;
        assert_eq!(module.table().await.fingerprint(), first);
    }

    #[tokio::test]
    async fn poll_data_needs_live_status() {
        let (_, module) = gasguard2(MockBlocks::default());
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();

        let mut map = AddressMap::new();
        map.set(5, 0b0000_0000_0000_0001);
        map.set(5 + proto::STATUS_OFFSET, 0b1001);
        let values = module.process_module_data(map.clone()).await;
        assert_eq!(values["set-point-alarm-1"], Value::Bool(true));
        assert_eq!(values["trip-status"], Value::Bool(true));
        assert_eq!(values["status-flags-l1-own-bit"], Value::Bool(true));

        map.set(5 + proto::STATUS_OFFSET, 0b0001);
        let values = module.process_module_data(map).await;
        assert!(!values.contains_key("set-point-alarm-1"));
        assert_eq!(values["status-flags-on-scan-bit"], Value::Bool(true));

        let values = module
            .process_module_data(AddressMap::from_registers(5, &[1]))
            .await;
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn io_feedback() {
        let mut base = ParameterTable::new();
        base.insert_block(
            0,
            ParamBits::new(0x40E, (1..=4).map(|n| (format!("invert-status-{n}"), n as u8 - 1))),
        )
        .insert_block(
            0,
            ParamBits::new(0x40F, (1..=4).map(|n| (format!("switch-status-raw-{n}"), n as u8 - 1))),
        );
        let blocks = Arc::new(MockBlocks::default().with_block(0, [0b0101, 0b0011, 0, 0]));
        let module = Module::new(Family::Di4, blocks, EventBus::new(), Schedule::new()).with_base_table(base);
        module.update_from_roll_call(&roll_call(22, 0, 15, 30)).await.unwrap();
        let read = module.find_missing_starting_data().await;
        assert_eq!(read["invert-status-1"], Value::Bool(true));

        struct RawTrigger;
        impl Triggers for RawTrigger {
            fn run(&self, _state: &ModuleState, data: &Values, _timestamp: SystemTime) -> TriggerOutput {
                TriggerOutput {
                    event: data.clone(),
                    ..Default::default()
                }
            }
        }
        let mut rx = module.events().subscribe();
        let data = Values::from([("switch-status-raw-2".to_string(), Value::Bool(false))]);
        let output = module.relay(&RawTrigger, &data, SystemTime::now()).await.unwrap();
        assert_eq!(output.event, data);
        assert_eq!(module.state().await.event(), &data);

        let derived = module.poll_subscription().await;
        assert_eq!(derived["switch-status-1"], Value::Bool(false));
        assert_eq!(derived["switch-status-2"], Value::Bool(false));
        assert_eq!(derived["switch-status-3"], Value::Bool(true));
        assert_eq!(derived["switch-status-4"], Value::Bool(false));

        assert_eq!(rx.try_recv().unwrap().topic, "parameter_trigger/22-G1/switch-status-raw-2");
        let published = rx.try_recv().unwrap();
        assert_eq!(published.values_for("22-G1"), Some(&derived));
    }

    #[tokio::test]
    async fn starting_data_gives_up_after_retries() {
        let blocks = Arc::new(MockBlocks::default().with_block(0, [0, 1, 100, 2]));
        let module = Module::new(Family::SimP, blocks.clone(), EventBus::new(), Schedule::new());
        module.update_from_roll_call(&roll_call(9, 0, 35, 40)).await.unwrap();
        blocks.fail(0);
        assert!(module.find_missing_starting_data().await.is_empty());
        assert_eq!(blocks.log().len(), 2);

        blocks.failing.lock().unwrap().clear();
        let read = module.find_missing_starting_data().await;
        assert_eq!(read["modbus-register-count"], Value::Int(2));
        let table = module.table().await;
        assert!(table.kind("raw-word-1").is_some());
        assert!(table.kind("raw-word-2").is_none());
        let addresses = module.identify_addresses().await;
        assert_eq!(addresses["raw-word-0"], Value::Int(41));
        assert_eq!(addresses["raw-word-1"], Value::Int(42));

        let log_len = blocks.log().len();
        assert!(module.find_missing_starting_data().await.is_empty());
        assert_eq!(blocks.log().len(), log_len);
    }

    #[tokio::test]
    async fn gasguard2_disconnect_releases_addresses() {
        let (blocks, module) = gasguard2(
            MockBlocks::default()
                .with_block(0, [5, 0, 0, 0x0108])
                .with_block(1, [6, 0, 0, 0])
                .with_block(2, [0, 0, 0, 0]),
        );
        module.update_from_roll_call(&roll_call(1000, 0, 61, 5)).await.unwrap();
        module.update_from_roll_call(&roll_call(1000, 0, 62, 6)).await.unwrap();
        module
            .read_parameters(&names(&["address-bypass", "address-power"]))
            .await
            .unwrap();
        module.disconnect().await.unwrap();

        assert_eq!(blocks.params(0), vec![0, 0, 0, 0x0100]);
        assert_eq!(blocks.params(1), vec![0, 0, 0, 0]);
        assert!(!blocks.log().contains(&"write 2".to_string()));
        assert_eq!(module.get("address-flags").await, Some(Value::Int(0)));
        assert!(module.schedule().is_empty().await);
    }
}
