//! Match plan generation.
//!
//! The planner is a pure function of its inputs: the same roster, layouts and options always give
//! the same leagues, in the same order, with the same match identities.
//!
//! # Leagues
//!
//! Non-staff teams are dealt round the leagues in roster order: team `i` joins league
//! `i % split_count`. Staff teams are baselines and join every league. Without staff teams the
//! leagues are disjoint and cover the roster.
//!
//! # Pairings
//!
//! Within a league, every unordered pair `(i, j)` with `i < j` in league order is played once per
//! layout (twice, colours swapped, with [`MatchPlanner::with_both_sides`]). In staff mode, only
//! staff-versus-other pairs are kept, staff playing red.

use std::collections::HashSet;

use tracing::info;

use crate::{contest::Match, error::ContestError, layout::Layout, team::Team};

/// One independent round-robin group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct League {
    /// League index, part of every match identity.
    pub index: usize,
    /// Teams of the league, in roster order.
    pub teams: Vec<Team>,
    /// Matches of the league, in plan order.
    pub matches: Vec<Match>,
}

/// Builds match plans.
#[derive(Debug, Clone)]
pub struct MatchPlanner {
    max_steps: u32,
    both_sides: bool,
}

impl MatchPlanner {
    /// Planner giving every match `max_steps` steps.
    pub fn new(max_steps: u32) -> MatchPlanner {
        MatchPlanner {
            max_steps,
            both_sides: false,
        }
    }

    /// Also play every pairing with colours swapped.
    pub fn with_both_sides(self, both_sides: bool) -> MatchPlanner {
        MatchPlanner { both_sides, ..self }
    }

    /// Splits `teams` into `split_count` leagues and round-robins each of them.
    ///
    /// `staff_team_ids` adds to the teams already flagged as staff in the roster.
    pub fn plan(
        &self,
        teams: &[Team],
        layouts: &[Layout],
        split_count: usize,
        staff_team_ids: &[String],
        staff_vs_others_only: bool,
    ) -> Result<Vec<League>, ContestError> {
        if split_count == 0 {
            return Err(ContestError::config("split count must be at least 1"));
        }
        if teams.len() < 2 {
            return Err(ContestError::config(format!(
                "at least 2 teams are needed, {} available",
                teams.len()
            )));
        }
        if layouts.is_empty() {
            return Err(ContestError::config("no layout to play on"));
        }
        let mut seen = HashSet::new();
        for team in teams {
            if !seen.insert(team.id.as_str()) {
                return Err(ContestError::config(format!(
                    "duplicate team identifier '{}'",
                    team.id
                )));
            }
        }
        for id in staff_team_ids {
            if !seen.contains(id.as_str()) {
                return Err(ContestError::config(format!(
                    "staff team '{id}' is not in the roster"
                )));
            }
        }

        let is_staff = |team: &Team| team.staff || staff_team_ids.contains(&team.id);
        let staff = teams.iter().filter(|t| is_staff(t)).cloned().collect::<Vec<_>>();
        let others = teams.iter().filter(|t| !is_staff(t)).cloned().collect::<Vec<_>>();
        let staff_mode = staff_vs_others_only && !staff.is_empty();

        let mut leagues = (0..split_count)
            .map(|index| League {
                index,
                teams: vec![],
                matches: vec![],
            })
            .collect::<Vec<_>>();
        for (i, team) in others.iter().enumerate() {
            leagues[i % split_count].teams.push(team.clone());
        }

        for league in &mut leagues {
            if staff_mode && league.teams.is_empty() {
                return Err(ContestError::config(format!(
                    "league {} has no non-staff team to play the staff teams",
                    league.index
                )));
            }
            // keep roster order inside the league
            league.teams.extend(staff.iter().cloned());
            league.teams.sort_by_key(|t| teams.iter().position(|r| r.id == t.id));

            if league.teams.len() < 2 {
                return Err(ContestError::config(format!(
                    "{} teams cannot be split into {split_count} leagues of at least 2 teams",
                    teams.len()
                )));
            }

            let pairs = self.pairings(&league.teams, &is_staff, staff_mode);
            for (red, blue) in pairs {
                for layout in layouts {
                    league.matches.push(Match::new(
                        league.index,
                        &red.id,
                        &blue.id,
                        layout.clone(),
                        self.max_steps,
                    ));
                    if self.both_sides {
                        league.matches.push(Match::new(
                            league.index,
                            &blue.id,
                            &red.id,
                            layout.clone(),
                            self.max_steps,
                        ));
                    }
                }
            }
            info!(
                league = league.index,
                teams = league.teams.len(),
                matches = league.matches.len(),
                "league planned"
            );
        }

        Ok(leagues)
    }

    fn pairings<'a>(
        &self,
        teams: &'a [Team],
        is_staff: &dyn Fn(&Team) -> bool,
        staff_mode: bool,
    ) -> Vec<(&'a Team, &'a Team)> {
        let n = teams.len();
        let mut pending = vec![];
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (&teams[i], &teams[j]);
                if !staff_mode {
                    pending.push((a, b));
                } else if is_staff(a) != is_staff(b) {
                    // staff always plays red
                    if is_staff(a) {
                        pending.push((a, b));
                    } else {
                        pending.push((b, a));
                    }
                }
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn roster(ids: &[&str]) -> Vec<Team> {
        ids.iter()
            .map(|id| Team::new(*id, format!("/subs/{id}.zip")))
            .collect()
    }

    fn one_layout() -> Vec<Layout> {
        vec![Layout::fixed("jumbo")]
    }

    #[test]
    fn four_teams_round_robin() {
        let leagues = MatchPlanner::new(1200)
            .plan(&roster(&["A", "B", "C", "D"]), &one_layout(), 1, &[], false)
            .unwrap();
        assert_eq!(leagues.len(), 1);
        let pairs = leagues[0]
            .matches
            .iter()
            .map(|m| format!("{}{}", m.red, m.blue))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec!["AB", "AC", "AD", "BC", "BD", "CD"]);
    }

    #[test]
    fn count_per_layout_no_duplicates() {
        let teams = roster(&["a", "b", "c", "d", "e", "f", "g"]);
        let layouts = vec![Layout::fixed("x"), Layout::random(1), Layout::random(2)];
        let leagues = MatchPlanner::new(100)
            .plan(&teams, &layouts, 1, &[], false)
            .unwrap();
        let matches = &leagues[0].matches;
        assert_eq!(matches.len(), 7 * 6 / 2 * 3);
        let ids = matches.iter().map(|m| m.id.clone()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), matches.len());
        assert!(matches.iter().all(|m| m.red != m.blue));
        let unordered = matches
            .iter()
            .map(|m| {
                let mut pair = [m.red.clone(), m.blue.clone()];
                pair.sort();
                (pair, m.layout.key())
            })
            .collect::<HashSet<_>>();
        assert_eq!(unordered.len(), matches.len());
    }

    #[test]
    fn plan_is_reproducible() {
        let teams = roster(&["a", "b", "c", "d", "e"]);
        let layouts = vec![Layout::fixed("x"), Layout::random(9)];
        let planner = MatchPlanner::new(100).with_both_sides(true);
        let first = planner.plan(&teams, &layouts, 2, &[], false).unwrap();
        let second = planner.plan(&teams, &layouts, 2, &[], false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn split_leagues_are_disjoint() {
        let teams = roster(&["a", "b", "c", "d", "e", "f", "g"]);
        let leagues = MatchPlanner::new(100)
            .plan(&teams, &one_layout(), 3, &[], false)
            .unwrap();
        assert_eq!(leagues.len(), 3);

        let mut union = HashSet::new();
        for league in &leagues {
            let members = league.teams.iter().map(|t| t.id.clone()).collect::<HashSet<_>>();
            for id in &members {
                assert!(union.insert(id.clone()), "{id} in two leagues");
            }
            let n = members.len();
            assert_eq!(league.matches.len(), n * (n - 1) / 2);
            for m in &league.matches {
                assert!(members.contains(&m.red) && members.contains(&m.blue));
                assert_eq!(m.league, league.index);
            }
        }
        assert_eq!(union.len(), teams.len());
        // i % k dealing
        assert_eq!(
            leagues[0].teams.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "d", "g"]
        );
    }

    #[test]
    fn staff_versus_others_only() {
        let mut teams = roster(&["s1", "s2", "x", "y", "z"]);
        teams[0].staff = true;
        let staff_ids = vec!["s2".to_owned()];
        let leagues = MatchPlanner::new(100)
            .plan(&teams, &one_layout(), 1, &staff_ids, true)
            .unwrap();
        let matches = &leagues[0].matches;
        assert_eq!(matches.len(), 6);
        for m in matches {
            assert!(m.red.starts_with('s'));
            assert!(!m.blue.starts_with('s'));
        }
    }

    #[test]
    fn staff_join_every_league() {
        let mut teams = roster(&["s", "a", "b", "c", "d"]);
        teams[0].staff = true;
        let leagues = MatchPlanner::new(100)
            .plan(&teams, &one_layout(), 2, &[], true)
            .unwrap();
        for league in &leagues {
            assert_eq!(league.teams[0].id, "s");
            assert_eq!(league.matches.len(), 2);
        }
    }

    #[test]
    fn configuration_errors() {
        let planner = MatchPlanner::new(100);
        let layouts = one_layout();
        assert!(planner.plan(&roster(&["a"]), &layouts, 1, &[], false).is_err());
        assert!(planner.plan(&roster(&["a", "a"]), &layouts, 1, &[], false).is_err());
        assert!(planner.plan(&roster(&["a", "b", "c"]), &layouts, 2, &[], false).is_err());
        assert!(planner.plan(&roster(&["a", "b"]), &layouts, 0, &[], false).is_err());
        assert!(planner.plan(&roster(&["a", "b"]), &[], 1, &[], false).is_err());
        assert!(planner
            .plan(&roster(&["a", "b"]), &layouts, 1, &["zz".to_owned()], false)
            .is_err());
    }
}
