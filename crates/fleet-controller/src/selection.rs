//! Scale-in victim selection.
//!
//! Pure functions over a membership snapshot: no locks, no I/O.

use std::cmp::Ordering;

use fleet_state::{FleetMember, HealthState, MemberId};

/// Termination order: Unhealthy first, then oldest launch time, ties
/// broken by id. Members already terminating are left out.
pub fn rank_for_termination(members: &[FleetMember]) -> Vec<&FleetMember> {
    let mut ranked: Vec<&FleetMember> = members.iter().filter(|m| m.in_service()).collect();
    ranked.sort_by(|a, b| compare(a, b));
    ranked
}

/// Pick the first `count` members in termination order.
pub fn select_victims(members: &[FleetMember], count: usize) -> Vec<MemberId> {
    rank_for_termination(members)
        .into_iter()
        .take(count)
        .map(|m| m.id.clone())
        .collect()
}

fn compare(a: &FleetMember, b: &FleetMember) -> Ordering {
    let unhealthy = |m: &FleetMember| m.health_state == HealthState::Unhealthy;
    unhealthy(b)
        .cmp(&unhealthy(a))
        .then(a.launch_time.cmp(&b.launch_time))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, launch_time: u64, health: HealthState) -> FleetMember {
        FleetMember {
            id: id.to_string(),
            address: format!("{id}:8080"),
            launch_time,
            health_state: health,
            registered: health == HealthState::Healthy,
            terminating: false,
        }
    }

    #[test]
    fn unhealthy_member_goes_first() {
        let members = vec![
            member("a", 100, HealthState::Healthy),
            member("b", 200, HealthState::Unhealthy),
            member("c", 50, HealthState::Healthy),
        ];
        assert_eq!(select_victims(&members, 1), vec!["b"]);
    }

    #[test]
    fn oldest_healthy_or_unknown_next() {
        let members = vec![
            member("new", 300, HealthState::Healthy),
            member("old", 100, HealthState::Unknown),
            member("mid", 200, HealthState::Healthy),
        ];
        assert_eq!(select_victims(&members, 2), vec!["old", "mid"]);
    }

    #[test]
    fn ties_break_by_id() {
        let members = vec![
            member("z", 100, HealthState::Healthy),
            member("a", 100, HealthState::Healthy),
        ];
        assert_eq!(select_victims(&members, 1), vec!["a"]);
    }

    #[test]
    fn terminating_members_are_skipped() {
        let mut draining = member("draining", 10, HealthState::Unhealthy);
        draining.terminating = true;
        let members = vec![draining, member("a", 100, HealthState::Healthy)];
        assert_eq!(select_victims(&members, 2), vec!["a"]);
    }

    #[test]
    fn selection_is_deterministic() {
        let members = vec![
            member("c", 100, HealthState::Unhealthy),
            member("b", 100, HealthState::Unhealthy),
            member("a", 300, HealthState::Healthy),
        ];
        let first = select_victims(&members, 3);
        let mut reversed = members.clone();
        reversed.reverse();
        assert_eq!(first, select_victims(&reversed, 3));
        assert_eq!(first, vec!["b", "c", "a"]);
    }
}
