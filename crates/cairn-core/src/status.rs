//! The status-set entry point used by unit agents.

use crate::{CoreError, Service, Unit};
use cairn_schema::{parse_status_data, StatusData, WorkloadStatus};

const USAGE: &str = "invalid args, require <status> [message] [data]";

/// Arguments of a status-set call: `<status> [message] [data]`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSetArgs {
    pub status: WorkloadStatus,
    pub message: String,
    pub data: StatusData,
}

impl StatusSetArgs {
    /// Parse raw arguments. Data is a YAML map whose keys must all be
    /// strings, at any depth.
    pub fn parse(args: &[String]) -> Result<Self, CoreError> {
        let (status, rest) = args
            .split_first()
            .ok_or_else(|| CoreError::Validation(USAGE.to_owned()))?;
        if rest.len() > 2 {
            let extra: Vec<String> = rest[2..].iter().map(|a| format!("{a:?}")).collect();
            return Err(CoreError::Validation(format!(
                "unrecognized args: [{}]",
                extra.join(" ")
            )));
        }
        let status: WorkloadStatus = status.parse().map_err(CoreError::Validation)?;
        let message = rest.first().cloned().unwrap_or_default();
        let data = match rest.get(1) {
            Some(text) => parse_status_data(text)?,
            None => StatusData::new(),
        };
        Ok(Self {
            status,
            message,
            data,
        })
    }
}

pub fn set_unit_status(unit: &mut Unit, args: &StatusSetArgs) -> Result<(), CoreError> {
    unit.set_status(args.status, &args.message, args.data.clone())
}

/// Set the status of the service `caller` belongs to. Only the service
/// leader may do so.
pub fn set_service_status(
    service: &mut Service,
    caller: &Unit,
    args: &StatusSetArgs,
) -> Result<(), CoreError> {
    service.set_status(caller, args.status, &args.message, args.data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Lifecycle, State};
    use cairn_schema::{CharmArchive, CharmMeta, CharmUrl, StateConfig};
    use cairn_store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn parse_errors() {
        let cases: &[(&[&str], &str)] = &[
            (&[], "invalid args, require <status> [message] [data]"),
            (
                &["maintenance", "msg", "", "extra"],
                "unrecognized args: [\"extra\"]",
            ),
            (
                &["foo"],
                "invalid status \"foo\", expected one of [maintenance blocked waiting active error]",
            ),
            (
                &["active", "msg", "{1: one}"],
                "cannot parse data to set status: cannot process data: keys must be strings",
            ),
        ];
        for (input, want) in cases {
            let err = StatusSetArgs::parse(&args(input)).unwrap_err();
            assert_eq!(err.to_string(), *want, "input {input:?}");
        }
    }

    #[test]
    fn parse_status_message_and_data() {
        let parsed = StatusSetArgs::parse(&args(&["active", "ready", "{port: 80, tags: {a: b}}"]))
            .unwrap();
        assert_eq!(parsed.status, WorkloadStatus::Active);
        assert_eq!(parsed.message, "ready");
        assert_eq!(
            serde_json::Value::Object(parsed.data),
            json!({"port": 80, "tags": {"a": "b"}})
        );

        let bare = StatusSetArgs::parse(&args(&["waiting"])).unwrap();
        assert_eq!(bare.message, "");
        assert!(bare.data.is_empty());
    }

    #[test]
    fn only_leader_sets_service_status() {
        let st =
            State::with_store(Arc::new(MemoryStore::new()), StateConfig::default(), "").unwrap();
        let meta = CharmMeta::parse_str("name = \"riak\"\n").unwrap();
        let url: CharmUrl = "local:series/riak-1".parse().unwrap();
        let charm = st
            .add_charm(&url, &CharmArchive::new(meta, b"riak".to_vec()))
            .unwrap();
        let mut svc = st.add_service("", &charm).unwrap();
        let mut u0 = svc.add_unit().unwrap();
        let u1 = svc.add_unit().unwrap();
        svc.claim_leadership(&u0).unwrap();

        let active = StatusSetArgs::parse(&args(&["active", "all good"])).unwrap();
        let err = set_service_status(&mut svc, &u1, &active).unwrap_err();
        assert_eq!(err.to_string(), "this unit is not the leader");
        set_service_status(&mut svc, &u0, &active).unwrap();
        assert_eq!(
            st.service("riak").unwrap().status().map(|s| s.status),
            Some(WorkloadStatus::Active)
        );

        set_unit_status(&mut u0, &active).unwrap();
        assert_eq!(st.unit("riak/0").unwrap().status().message, "all good");
    }

    #[test]
    fn leadership_is_checked_against_stored_service() {
        let st =
            State::with_store(Arc::new(MemoryStore::new()), StateConfig::default(), "").unwrap();
        let meta = CharmMeta::parse_str("name = \"riak\"\n").unwrap();
        let url: CharmUrl = "local:series/riak-1".parse().unwrap();
        let charm = st
            .add_charm(&url, &CharmArchive::new(meta, b"riak".to_vec()))
            .unwrap();
        let mut svc = st.add_service("", &charm).unwrap();
        let mut u0 = svc.add_unit().unwrap();
        let u1 = svc.add_unit().unwrap();
        svc.claim_leadership(&u0).unwrap();

        // Leadership moves through another handle; `svc` still names u0.
        u0.destroy().unwrap();
        u0.ensure_dead().unwrap();
        let mut other = st.service("riak").unwrap();
        other.claim_leadership(&u1).unwrap();
        assert_eq!(svc.leader(), Some("riak/0"));

        let blocked = StatusSetArgs::parse(&args(&["blocked", "stale"])).unwrap();
        let err = set_service_status(&mut svc, &u0, &blocked).unwrap_err();
        assert_eq!(err.to_string(), "this unit is not the leader");
        assert_eq!(st.service("riak").unwrap().status(), None);

        set_service_status(&mut svc, &u1, &blocked).unwrap();
        assert_eq!(svc.leader(), Some("riak/1"));
        assert_eq!(
            svc.status().map(|s| s.message.as_str()),
            Some("stale")
        );
    }
}
