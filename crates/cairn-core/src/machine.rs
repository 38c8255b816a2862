use crate::lifecycle::Lifecycle;
use crate::state::MACHINES;
use crate::{CoreError, State};
use cairn_schema::{Life, MachineId};
use cairn_store::document::encode;
use cairn_store::{Assert, Document, FieldOp, Op};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct MachineDoc {
    pub id: MachineId,
    pub life: Life,
    #[serde(default)]
    pub instance_id: String,
    /// Principal units assigned to this machine.
    #[serde(default)]
    pub principals: Vec<String>,
}

impl MachineDoc {
    pub(crate) fn new(id: MachineId) -> Self {
        Self {
            id,
            life: Life::Alive,
            instance_id: String::new(),
            principals: Vec::new(),
        }
    }
}

/// A machine that units are deployed to.
#[derive(Clone)]
pub struct Machine {
    state: State,
    doc: MachineDoc,
}

impl Machine {
    pub(crate) fn from_doc(state: &State, doc: &Document) -> Result<Self, CoreError> {
        Ok(Self {
            state: state.clone(),
            doc: doc.decode()?,
        })
    }

    pub fn id(&self) -> &MachineId {
        &self.doc.id
    }

    pub fn instance_id(&self) -> &str {
        &self.doc.instance_id
    }

    pub fn principals(&self) -> &[String] {
        &self.doc.principals
    }

    pub fn agent_id(&self) -> cairn_schema::AgentId {
        self.doc.id.agent_id()
    }

    pub fn refresh(&mut self) -> Result<(), CoreError> {
        let doc = self
            .state
            .read(MACHINES, &self.doc.id)?
            .ok_or_else(|| CoreError::NotFound(self.describe()))?;
        self.doc = doc.decode()?;
        Ok(())
    }

    /// Record the provider instance backing this machine. It can only be set
    /// once.
    pub fn set_instance_id(&mut self, instance_id: &str) -> Result<(), CoreError> {
        let id = self.doc.id.clone();
        self.state.run_transaction(|_| {
            let Some(doc) = self.state.read(MACHINES, &id)? else {
                return Err(CoreError::NotFound(self.describe()));
            };
            let current = doc.str_field("instance_id");
            if current == instance_id {
                return Ok(Vec::new());
            }
            if !current.is_empty() {
                return Err(CoreError::precondition(
                    self.describe(),
                    format!("{} already has instance \"{current}\"", self.describe()),
                ));
            }
            Ok(vec![Op::new(MACHINES, id.as_str())
                .assert(Assert::eq("instance_id", current))
                .update(vec![FieldOp::set("instance_id", instance_id)])])
        })?;
        self.doc.instance_id = instance_id.to_owned();
        Ok(())
    }
}

impl Lifecycle for Machine {
    fn state(&self) -> &State {
        &self.state
    }

    fn collection(&self) -> &'static str {
        MACHINES
    }

    fn doc_id(&self) -> &str {
        &self.doc.id
    }

    fn describe(&self) -> String {
        format!("machine {}", self.doc.id)
    }

    fn life(&self) -> Life {
        self.doc.life
    }

    fn set_cached_life(&mut self, life: Life) {
        self.doc.life = life;
    }

    fn transition_guard(&self, doc: &Document, _to: Life) -> Result<Vec<Assert>, CoreError> {
        let principals = doc.str_list("principals");
        if let Some(unit) = principals.first() {
            return Err(CoreError::precondition(
                self.describe(),
                format!("{} has unit \"{unit}\" assigned", self.describe()),
            ));
        }
        Ok(vec![Assert::eq("principals", Value::Array(Vec::new()))])
    }
}

impl State {
    /// Add a machine numbered from the global machine sequence.
    pub fn add_machine(&self) -> Result<Machine, CoreError> {
        let mut added = None;
        self.run_transaction(|_| {
            let (n, seq) = self.sequence("machine", 1)?;
            let doc = MachineDoc::new(MachineId::new(n.to_string()));
            let op = Op::new(MACHINES, doc.id.as_str()).insert(encode(&doc)?);
            added = Some(doc);
            Ok(vec![seq, op])
        })?;
        let doc = added.ok_or_else(|| CoreError::Conflict("machine was not added".to_owned()))?;
        info!("added machine {}", doc.id);
        Ok(Machine {
            state: self.clone(),
            doc,
        })
    }

    pub fn machine(&self, id: &str) -> Result<Machine, CoreError> {
        let doc = self
            .read(MACHINES, id)?
            .ok_or_else(|| CoreError::NotFound(format!("machine {id}")))?;
        Machine::from_doc(self, &doc)
    }

    pub fn all_machines(&self) -> Result<Vec<Machine>, CoreError> {
        let mut machines = self
            .list(MACHINES)?
            .iter()
            .map(|doc| Machine::from_doc(self, doc))
            .collect::<Result<Vec<_>, _>>()?;
        machines.sort_by_key(|m| m.id().parse::<u64>().unwrap_or(u64::MAX));
        Ok(machines)
    }
}
