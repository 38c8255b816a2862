use crate::lifecycle::{doc_life, Lifecycle};
use crate::machine::MachineDoc;
use crate::state::{MACHINES, SERVICES, UNITS};
use crate::{CoreError, Machine, Service, State};
use cairn_schema::{
    validate_unit_name, AgentId, Life, MachineId, ResolvedMode, StatusData, StatusInfo, UnitName,
    WorkloadStatus,
};
use cairn_store::document::encode;
use cairn_store::{Assert, ChangeEntry, Document, FieldOp, Op};
use cairn_watch::{Pinger, PresenceChange, Subscription, Target};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct UnitDoc {
    pub name: UnitName,
    pub service: String,
    pub life: Life,
    /// Name of the principal unit; empty for principals.
    #[serde(default)]
    pub principal: String,
    #[serde(default)]
    pub subordinates: Vec<String>,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub resolved: ResolvedMode,
    pub status: StatusInfo,
    #[serde(default)]
    pub private_address: String,
}

impl UnitDoc {
    pub(crate) fn new(name: UnitName, service: &str, principal: &str, machine_id: &str) -> Self {
        Self {
            name,
            service: service.to_owned(),
            life: Life::Alive,
            principal: principal.to_owned(),
            subordinates: Vec::new(),
            machine_id: machine_id.to_owned(),
            resolved: ResolvedMode::None,
            status: StatusInfo {
                status: WorkloadStatus::Unknown,
                message: String::new(),
                data: StatusData::new(),
                since: Utc::now(),
            },
            private_address: String::new(),
        }
    }
}

/// Build a status record, refusing an error status without a message.
pub(crate) fn status_info(
    status: WorkloadStatus,
    message: &str,
    data: StatusData,
) -> Result<StatusInfo, CoreError> {
    if status == WorkloadStatus::Error && message.is_empty() {
        return Err(CoreError::Validation(format!(
            "cannot set status \"{status}\" without info"
        )));
    }
    Ok(StatusInfo {
        status,
        message: message.to_owned(),
        data,
        since: Utc::now(),
    })
}

fn unit_desc(name: &str) -> String {
    format!("unit \"{name}\"")
}

/// A running instance of a service.
#[derive(Clone)]
pub struct Unit {
    state: State,
    doc: UnitDoc,
}

impl Unit {
    pub(crate) fn new(state: &State, doc: UnitDoc) -> Self {
        Self {
            state: state.clone(),
            doc,
        }
    }

    pub(crate) fn from_doc(state: &State, doc: &Document) -> Result<Self, CoreError> {
        Ok(Self::new(state, doc.decode()?))
    }

    pub fn name(&self) -> &UnitName {
        &self.doc.name
    }

    pub fn service_name(&self) -> &str {
        &self.doc.service
    }

    /// The unit's number within its service.
    pub fn number(&self) -> u64 {
        self.doc
            .name
            .rsplit_once('/')
            .and_then(|(_, n)| n.parse().ok())
            .unwrap_or(u64::MAX)
    }

    pub fn is_principal(&self) -> bool {
        self.doc.principal.is_empty()
    }

    pub fn principal_name(&self) -> Option<&str> {
        Some(self.doc.principal.as_str()).filter(|p| !p.is_empty())
    }

    pub fn subordinate_names(&self) -> &[String] {
        &self.doc.subordinates
    }

    pub fn machine_id(&self) -> Option<&str> {
        Some(self.doc.machine_id.as_str()).filter(|m| !m.is_empty())
    }

    pub fn resolved(&self) -> ResolvedMode {
        self.doc.resolved
    }

    pub fn status(&self) -> &StatusInfo {
        &self.doc.status
    }

    pub fn private_address(&self) -> Option<&str> {
        Some(self.doc.private_address.as_str()).filter(|a| !a.is_empty())
    }

    pub fn agent_id(&self) -> AgentId {
        self.doc.name.agent_id()
    }

    pub fn service(&self) -> Result<Service, CoreError> {
        self.state.service(&self.doc.service)
    }

    pub fn refresh(&mut self) -> Result<(), CoreError> {
        let doc = self
            .state
            .read(UNITS, &self.doc.name)?
            .ok_or_else(|| CoreError::NotFound(self.describe()))?;
        self.doc = doc.decode()?;
        Ok(())
    }

    fn read_doc(&self) -> Result<Document, CoreError> {
        self.state
            .read(UNITS, &self.doc.name)?
            .ok_or_else(|| CoreError::NotFound(self.describe()))
    }

    fn op(&self) -> Op {
        Op::new(UNITS, self.doc.name.as_str())
    }

    pub fn set_status(
        &mut self,
        status: WorkloadStatus,
        message: &str,
        data: StatusData,
    ) -> Result<(), CoreError> {
        let info = status_info(status, message, data)?;
        let value = serde_json::to_value(&info)?;
        self.state.run_transaction(|_| {
            let doc = self.read_doc()?;
            if doc_life(&doc)? == Life::Dead {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!("cannot set status of {}: unit is dead", self.describe()),
                ));
            }
            Ok(vec![self
                .op()
                .assert(Assert::ne("life", Life::Dead.as_str()))
                .update(vec![FieldOp::Set("status".to_owned(), value.clone())])])
        })?;
        debug!("{} status {status}", self.describe());
        self.doc.status = info;
        Ok(())
    }

    /// Mark an errored unit as resolved. Only possible while the unit is in
    /// error and no mode has been set since the last
    /// [`clear_resolved`](Self::clear_resolved).
    pub fn set_resolved(&mut self, mode: ResolvedMode) -> Result<(), CoreError> {
        if mode == ResolvedMode::None {
            return Err(CoreError::Validation(format!(
                "cannot set resolved mode for {}: invalid error resolution mode \"{mode}\"",
                self.describe()
            )));
        }
        self.state.run_transaction(|_| {
            let doc = self.read_doc()?;
            if doc.str_field("status.status") != WorkloadStatus::Error.as_str() {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!("{} is not in an error state", self.describe()),
                ));
            }
            if !doc.str_field("resolved").is_empty() {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!(
                        "cannot set resolved mode for {}: already resolved",
                        self.describe()
                    ),
                ));
            }
            Ok(vec![self
                .op()
                .assert(Assert::eq("status.status", WorkloadStatus::Error.as_str()))
                .assert(Assert::eq("resolved", ResolvedMode::None.as_str()))
                .update(vec![FieldOp::set("resolved", mode.as_str())])])
        })?;
        info!("{} resolved with {mode}", self.describe());
        self.doc.resolved = mode;
        Ok(())
    }

    pub fn clear_resolved(&mut self) -> Result<(), CoreError> {
        self.state.run_transaction(|_| {
            self.read_doc()?;
            Ok(vec![self
                .op()
                .update(vec![FieldOp::set("resolved", ResolvedMode::None.as_str())])])
        })?;
        self.doc.resolved = ResolvedMode::None;
        Ok(())
    }

    pub fn set_private_address(&mut self, address: &str) -> Result<(), CoreError> {
        self.state.run_transaction(|_| {
            self.read_doc()?;
            Ok(vec![self
                .op()
                .update(vec![FieldOp::set("private_address", address)])])
        })?;
        self.doc.private_address = address.to_owned();
        Ok(())
    }

    /// Start destroying an alive principal unit. Subordinates are left to
    /// their own agents.
    pub fn destroy(&mut self) -> Result<(), CoreError> {
        self.state.run_transaction(|_| {
            let alive = match self.state.read(UNITS, &self.doc.name)? {
                Some(doc) => doc_life(&doc)? == Life::Alive,
                None => false,
            };
            if !alive {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!("{} is not alive", self.describe()),
                ));
            }
            if !self.is_principal() {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!("{} is a subordinate", self.describe()),
                ));
            }
            Ok(vec![self
                .op()
                .assert(Assert::eq("life", Life::Alive.as_str()))
                .assert(Assert::eq("principal", ""))
                .update(vec![FieldOp::set("life", Life::Dying.as_str())])])
        })?;
        info!("{} is dying", self.describe());
        self.doc.life = Life::Dying;
        Ok(())
    }

    /// Delete a dead unit, detaching it from its service, machine and
    /// principal.
    pub fn remove(&mut self) -> Result<(), CoreError> {
        let name = self.doc.name.to_string();
        self.state.run_transaction(|_| {
            let Some(doc) = self.state.read(UNITS, &name)? else {
                return Ok(Vec::new());
            };
            if doc_life(&doc)? != Life::Dead {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!("cannot remove {}: unit is not dead", self.describe()),
                ));
            }
            let unit: UnitDoc = doc.decode()?;
            let mut ops = vec![self
                .op()
                .assert(Assert::eq("life", Life::Dead.as_str()))
                .remove()];
            if let Some(svc) = self.state.read(SERVICES, &unit.service)? {
                let mut changes = vec![FieldOp::Inc("unit_count".to_owned(), -1)];
                if svc.str_field("leader") == name {
                    changes.push(FieldOp::set("leader", ""));
                }
                ops.push(Op::new(SERVICES, unit.service.as_str()).update(changes));
            }
            if unit.principal.is_empty() && !unit.machine_id.is_empty() {
                if self.state.read(MACHINES, &unit.machine_id)?.is_some() {
                    ops.push(
                        Op::new(MACHINES, unit.machine_id.as_str())
                            .update(vec![FieldOp::Pull("principals".to_owned(), name.clone().into())]),
                    );
                }
            } else if !unit.principal.is_empty()
                && self.state.read(UNITS, &unit.principal)?.is_some()
            {
                ops.push(
                    Op::new(UNITS, unit.principal.as_str())
                        .update(vec![FieldOp::Pull("subordinates".to_owned(), name.clone().into())]),
                );
            }
            Ok(ops)
        })?;
        info!("removed {}", self.describe());
        Ok(())
    }

    fn assignable_doc(&self) -> Result<Document, CoreError> {
        let doc = self.read_doc()?;
        let unit: UnitDoc = doc.decode()?;
        if unit.life != Life::Alive {
            return Err(CoreError::precondition(
                self.describe(),
                format!("cannot assign {}: unit is not alive", self.describe()),
            ));
        }
        if !unit.principal.is_empty() {
            return Err(CoreError::precondition(
                self.describe(),
                format!("cannot assign {}: unit is a subordinate", self.describe()),
            ));
        }
        if !unit.machine_id.is_empty() {
            return Err(CoreError::precondition(
                self.describe(),
                format!(
                    "cannot assign {}: unit is already assigned to machine {}",
                    self.describe(),
                    unit.machine_id
                ),
            ));
        }
        Ok(doc)
    }

    fn assign_op(&self, machine_id: &str) -> Op {
        self.op()
            .assert(Assert::eq("life", Life::Alive.as_str()))
            .assert(Assert::eq("machine_id", ""))
            .update(vec![FieldOp::set("machine_id", machine_id)])
    }

    /// Assign this principal unit to `machine`.
    pub fn assign_to_machine(&mut self, machine: &Machine) -> Result<(), CoreError> {
        let machine_id = machine.id().to_string();
        self.state.run_transaction(|_| {
            self.assignable_doc()?;
            let alive = match self.state.read(MACHINES, &machine_id)? {
                Some(doc) => doc_life(&doc)? == Life::Alive,
                None => false,
            };
            if !alive {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!(
                        "cannot assign {}: machine {machine_id} is not alive",
                        self.describe()
                    ),
                ));
            }
            Ok(vec![
                Op::new(MACHINES, machine_id.as_str())
                    .assert(Assert::eq("life", Life::Alive.as_str()))
                    .update(vec![FieldOp::AddToSet(
                        "principals".to_owned(),
                        self.doc.name.as_str().into(),
                    )]),
                self.assign_op(&machine_id),
            ])
        })?;
        info!("assigned {} to machine {machine_id}", self.describe());
        self.doc.machine_id = machine_id;
        Ok(())
    }

    /// Assign this principal unit to a machine hosting no other principal,
    /// adding a machine when none is free. Returns the machine.
    pub fn assign_to_unused_machine(&mut self) -> Result<Machine, CoreError> {
        let mut chosen = None;
        self.state.run_transaction(|_| {
            self.assignable_doc()?;
            let mut free: Vec<MachineDoc> = Vec::new();
            for doc in self.state.list(MACHINES)? {
                let machine: MachineDoc = doc.decode()?;
                if machine.life == Life::Alive && machine.principals.is_empty() {
                    free.push(machine);
                }
            }
            free.sort_by_key(|m| m.id.parse::<u64>().unwrap_or(u64::MAX));
            let unit_name: Value = self.doc.name.as_str().into();
            let mut ops = Vec::new();
            let machine = match free.into_iter().next() {
                Some(mut machine) => {
                    ops.push(
                        Op::new(MACHINES, machine.id.as_str())
                            .assert(Assert::eq("life", Life::Alive.as_str()))
                            .assert(Assert::eq("principals", Value::Array(Vec::new())))
                            .update(vec![FieldOp::AddToSet(
                                "principals".to_owned(),
                                unit_name,
                            )]),
                    );
                    machine.principals.push(self.doc.name.to_string());
                    machine
                }
                None => {
                    let (n, seq) = self.state.sequence("machine", 1)?;
                    let mut machine = MachineDoc::new(MachineId::new(n.to_string()));
                    machine.principals.push(self.doc.name.to_string());
                    ops.push(seq);
                    ops.push(Op::new(MACHINES, machine.id.as_str()).insert(encode(&machine)?));
                    machine
                }
            };
            ops.push(self.assign_op(&machine.id));
            chosen = Some(machine);
            Ok(ops)
        })?;
        let machine =
            chosen.ok_or_else(|| CoreError::Conflict("unit was not assigned".to_owned()))?;
        info!("assigned {} to machine {}", self.describe(), machine.id);
        self.doc.machine_id = machine.id.to_string();
        self.state.machine(&machine.id)
    }

    /// Start heartbeating for this unit's agent.
    pub fn set_agent_alive(&self) -> Result<Pinger, CoreError> {
        let handle = self.state.handle()?;
        let store = self.state.runner()?.store().clone();
        Ok(Pinger::start(
            store,
            self.agent_id(),
            &self.state.config().presence,
            handle,
        ))
    }

    /// Whether this unit's agent was alive at the last presence scan.
    pub fn agent_alive(&self) -> Result<bool, CoreError> {
        Ok(self.state.running_presence()?.alive(&self.agent_id()))
    }

    pub fn watch_agent(&self) -> Result<Subscription<AgentId, PresenceChange>, CoreError> {
        Ok(self.state.running_presence()?.watch_agent(&self.agent_id()))
    }

    pub fn watch(&self) -> Result<Subscription<Target, ChangeEntry>, CoreError> {
        self.state.watch_document(UNITS, &self.doc.name)
    }
}

impl Lifecycle for Unit {
    fn state(&self) -> &State {
        &self.state
    }

    fn collection(&self) -> &'static str {
        UNITS
    }

    fn doc_id(&self) -> &str {
        &self.doc.name
    }

    fn describe(&self) -> String {
        unit_desc(&self.doc.name)
    }

    fn life(&self) -> Life {
        self.doc.life
    }

    fn set_cached_life(&mut self, life: Life) {
        self.doc.life = life;
    }

    fn transition_guard(&self, doc: &Document, to: Life) -> Result<Vec<Assert>, CoreError> {
        if to != Life::Dead {
            return Ok(Vec::new());
        }
        let subordinates = doc.str_list("subordinates");
        if !subordinates.is_empty() {
            return Err(CoreError::precondition(
                self.describe(),
                format!(
                    "{} cannot die while it has subordinates: {}",
                    self.describe(),
                    subordinates.join(", ")
                ),
            ));
        }
        Ok(vec![Assert::eq("subordinates", Value::Array(Vec::new()))])
    }
}

impl State {
    pub fn unit(&self, name: &str) -> Result<Unit, CoreError> {
        validate_unit_name(name)?;
        let doc = self
            .read(UNITS, name)?
            .ok_or_else(|| CoreError::NotFound(unit_desc(name)))?;
        Unit::from_doc(self, &doc)
    }

    pub fn all_units(&self) -> Result<Vec<Unit>, CoreError> {
        let mut units = self
            .list(UNITS)?
            .iter()
            .map(|doc| Unit::from_doc(self, doc))
            .collect::<Result<Vec<_>, _>>()?;
        units.sort_by(|a, b| {
            (a.service_name(), a.number()).cmp(&(b.service_name(), b.number()))
        });
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_schema::{CharmArchive, CharmMeta, CharmUrl, StateConfig};
    use cairn_store::MemoryStore;
    use std::sync::Arc;

    fn state() -> State {
        State::with_store(Arc::new(MemoryStore::new()), StateConfig::default(), "").unwrap()
    }

    fn service(st: &State, name: &str) -> Service {
        let meta = CharmMeta::parse_str("name = \"riak\"\n").unwrap();
        let url: CharmUrl = "local:series/riak-1".parse().unwrap();
        let charm = match st.charm(&url) {
            Ok(c) => c,
            Err(_) => st
                .add_charm(&url, &CharmArchive::new(meta, b"riak".to_vec()))
                .unwrap(),
        };
        st.add_service(name, &charm).unwrap()
    }

    #[test]
    fn error_status_requires_message() {
        let st = state();
        let mut u = service(&st, "riak").add_unit().unwrap();
        let err = u
            .set_status(WorkloadStatus::Error, "", StatusData::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot set status \"error\" without info");
        u.set_status(WorkloadStatus::Error, "gaaah", StatusData::new())
            .unwrap();
        let fresh = st.unit("riak/0").unwrap();
        assert_eq!(fresh.status().status, WorkloadStatus::Error);
        assert_eq!(fresh.status().message, "gaaah");
    }

    #[test]
    fn resolved_needs_error_and_is_set_once() {
        let st = state();
        let mut u = service(&st, "testriak").add_unit().unwrap();
        let err = u.set_resolved(ResolvedMode::RetryHooks).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unit \"testriak/0\" is not in an error state"
        );

        u.set_status(WorkloadStatus::Error, "gaaah", StatusData::new())
            .unwrap();
        u.set_resolved(ResolvedMode::RetryHooks).unwrap();
        let err = u.set_resolved(ResolvedMode::NoHooks).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot set resolved mode for unit \"testriak/0\": already resolved"
        );
        assert_eq!(st.unit("testriak/0").unwrap().resolved(), ResolvedMode::RetryHooks);

        u.clear_resolved().unwrap();
        u.set_resolved(ResolvedMode::NoHooks).unwrap();
        assert_eq!(st.unit("testriak/0").unwrap().resolved(), ResolvedMode::NoHooks);
    }

    #[test]
    fn destroy_is_refused_twice() {
        let st = state();
        let mut u = service(&st, "riak").add_unit().unwrap();
        u.destroy().unwrap();
        assert_eq!(u.life(), Life::Dying);
        let err = u.destroy().unwrap_err();
        assert_eq!(err.to_string(), "unit \"riak/0\" is not alive");
    }

    #[test]
    fn unused_machines_are_preferred() {
        let st = state();
        let mut svc = service(&st, "riak");
        let spare = st.add_machine().unwrap();

        let mut u0 = svc.add_unit().unwrap();
        let m0 = u0.assign_to_unused_machine().unwrap();
        assert_eq!(m0.id(), spare.id());
        assert_eq!(m0.principals(), ["riak/0"]);

        let mut u1 = svc.add_unit().unwrap();
        let m1 = u1.assign_to_unused_machine().unwrap();
        assert_ne!(m1.id(), m0.id());
        assert_eq!(u1.machine_id(), Some(m1.id().as_str()));

        let err = u1.assign_to_unused_machine().err().unwrap();
        assert!(err.to_string().contains("already assigned"));
    }

    #[test]
    fn remove_detaches_dead_unit() {
        let st = state();
        let mut svc = service(&st, "riak");
        let mut u = svc.add_unit().unwrap();
        let machine = u.assign_to_unused_machine().unwrap();
        svc.claim_leadership(&u).unwrap();

        assert!(u.remove().is_err());
        u.destroy().unwrap();
        u.ensure_dead().unwrap();
        u.remove().unwrap();

        assert!(matches!(st.unit("riak/0"), Err(CoreError::NotFound(_))));
        let machine = st.machine(machine.id()).unwrap();
        assert!(machine.principals().is_empty());
        svc.refresh().unwrap();
        assert_eq!(svc.unit_count(), 0);
        assert_eq!(svc.leader(), None);
    }

    #[test]
    fn private_address_round_trips_through_state() {
        let st = state();
        let mut u = service(&st, "riak").add_unit().unwrap();
        assert_eq!(u.private_address(), None);
        u.set_private_address("10.0.0.1").unwrap();
        assert_eq!(
            st.unit("riak/0").unwrap().private_address(),
            Some("10.0.0.1")
        );
    }

    #[test]
    fn presence_needs_a_runtime() {
        let st = state();
        let u = service(&st, "riak").add_unit().unwrap();
        assert!(matches!(u.agent_alive(), Err(CoreError::Config(_))));
        assert!(matches!(u.set_agent_alive(), Err(CoreError::Config(_))));
    }
}
