use roomcast_core::error::{Error, Result};
use std::collections::HashSet;

use super::{MixingConfiguration, Position, Target};

/// A position bound to the source it draws
#[derive(Debug, Clone)]
pub struct Placement {
    pub id: String,
    pub position: Position,
}

/// Bind one position per source
///
/// Positions naming an id are resolved first, then those naming an index
/// (in ascending index order), then the rest take the first unplaced ids in
/// registration order. Unknown ids, out-of-range indices and sources claimed
/// twice are configuration errors.
pub fn assign(config: &MixingConfiguration, ids: &[String]) -> Result<Vec<Placement>> {
    let mut positions = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        let position = config.position(id, index, ids)?;
        let order = match &position.target {
            Target::Index(resolve) => resolve(ids),
            _ => 0,
        };
        positions.push((position.target.tier(), order, position));
    }
    positions.sort_by_key(|(tier, order, _)| (*tier, *order));

    let mut placed = HashSet::with_capacity(ids.len());
    let mut placements = Vec::with_capacity(ids.len());
    for (_, order, position) in positions {
        let id = match &position.target {
            Target::Id(target) => {
                let id = target(ids);
                if !ids.contains(&id) {
                    return Err(Error::Configuration(format!("no source with id {id:?}")));
                }
                id
            }
            Target::Index(_) => ids.get(order).cloned().ok_or_else(|| {
                Error::Configuration(format!(
                    "index {order} out of range for {} sources",
                    ids.len()
                ))
            })?,
            Target::Auto => ids
                .iter()
                .find(|id| !placed.contains(*id))
                .cloned()
                .ok_or_else(|| {
                    Error::Configuration("more positions than sources".to_string())
                })?,
        };

        if !placed.insert(id.clone()) {
            return Err(Error::Configuration(format!(
                "source {id:?} is targeted by more than one position"
            )));
        }
        placements.push(Placement { id, position });
    }

    Ok(placements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Positions;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn slot(x: f64) -> Position {
        Position::new(x, 0.0, 10.0, 10.0)
    }

    fn bound(placements: &[Placement]) -> Vec<&str> {
        placements.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_every_source_placed_exactly_once() {
        let ids = ids(&["a", "b", "c", "d"]);
        let config = MixingConfiguration::new(Positions::generator(|_, index, _| {
            slot(index as f64)
        }));

        let placements = assign(&config, &ids).unwrap();
        assert_eq!(bound(&placements), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_id_beats_index_beats_auto() {
        let ids = ids(&["a", "b", "c"]);
        let config = MixingConfiguration::new(Positions::List(vec![
            slot(0.0),
            slot(1.0).with_index(0),
            slot(2.0).with_id("c"),
        ]));

        let placements = assign(&config, &ids).unwrap();
        assert_eq!(bound(&placements), vec!["c", "a", "b"]);
        let xs: Vec<_> = placements
            .iter()
            .map(|p| p.position.x.resolve(&crate::layout::RenderStats {
                width: 0.0,
                height: 0.0,
                id: p.id.clone(),
                draw_index: 0,
            }))
            .collect();
        assert_eq!(xs, vec![2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_indexed_positions_are_resolved_in_index_order() {
        let ids = ids(&["a", "b", "c"]);
        let config = MixingConfiguration::new(Positions::List(vec![
            slot(0.0).with_index(2),
            slot(1.0).with_index_fn(|ids| ids.len() - 3),
            slot(2.0),
        ]));

        assert_eq!(bound(&assign(&config, &ids).unwrap()), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_unknown_id_and_bad_index_are_errors() {
        let ids = ids(&["a", "b"]);

        let unknown = MixingConfiguration::new(Positions::List(vec![
            slot(0.0).with_id("z"),
            slot(1.0),
        ]));
        assert!(matches!(assign(&unknown, &ids), Err(Error::Configuration(_))));

        let out_of_range = MixingConfiguration::new(Positions::List(vec![
            slot(0.0).with_index(2),
            slot(1.0),
        ]));
        assert!(matches!(assign(&out_of_range, &ids), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_template_with_fixed_id_conflicts_for_several_sources() {
        let config = MixingConfiguration::new(Positions::Template(slot(0.0).with_id("a")));

        assert!(assign(&config, &ids(&["a"])).is_ok());
        assert!(matches!(
            assign(&config, &ids(&["a", "b"])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_no_sources_no_placements() {
        let config = MixingConfiguration::new(Positions::Template(slot(0.0)));
        assert!(assign(&config, &[]).unwrap().is_empty());
    }
}
