use crate::{CoreError, State};
use cairn_schema::Life;
use cairn_store::{Assert, Document, FieldOp, Op};
use tracing::debug;

pub(crate) fn doc_life(doc: &Document) -> Result<Life, CoreError> {
    doc.str_field("life")
        .parse()
        .map_err(|e: String| CoreError::Validation(format!("document \"{}\": {e}", doc.id)))
}

/// The `Alive -> Dying -> Dead` capability shared by machines, services,
/// units and relations.
pub trait Lifecycle {
    fn state(&self) -> &State;

    fn collection(&self) -> &'static str;

    fn doc_id(&self) -> &str;

    /// Human-readable name used in errors, e.g. `unit "wordpress/0"`.
    fn describe(&self) -> String;

    /// Life as of the last read.
    fn life(&self) -> Life;

    fn set_cached_life(&mut self, life: Life);

    /// Extra assertions `doc` must satisfy to advance to `to`, or the reason
    /// it cannot.
    fn transition_guard(&self, doc: &Document, to: Life) -> Result<Vec<Assert>, CoreError> {
        let _ = (doc, to);
        Ok(Vec::new())
    }

    fn ensure_dying(&mut self) -> Result<(), CoreError>
    where
        Self: Sized,
    {
        advance(self, Life::Dying)
    }

    fn ensure_dead(&mut self) -> Result<(), CoreError>
    where
        Self: Sized,
    {
        advance(self, Life::Dead)
    }
}

/// Move `entity` forward to `to`. Already being at or past `to` is success.
pub(crate) fn advance<E: Lifecycle>(entity: &mut E, to: Life) -> Result<(), CoreError> {
    if entity.life() >= to {
        return Ok(());
    }
    let state = entity.state().clone();
    let collection = entity.collection();
    let id = entity.doc_id().to_owned();
    let mut reached = None;
    state.run_transaction(|_| {
        let Some(doc) = state.read(collection, &id)? else {
            return Err(CoreError::NotFound(entity.describe()));
        };
        let life = doc_life(&doc)?;
        if life >= to {
            reached = Some(life);
            return Ok(Vec::new());
        }
        let mut op = Op::new(collection, &id).assert(Assert::eq("life", life.as_str()));
        for assert in entity.transition_guard(&doc, to)? {
            op = op.assert(assert);
        }
        reached = Some(to);
        Ok(vec![op.update(vec![FieldOp::set("life", to.as_str())])])
    })?;
    if let Some(life) = reached {
        debug!("{} is {life}", entity.describe());
        entity.set_cached_life(life);
    }
    Ok(())
}
