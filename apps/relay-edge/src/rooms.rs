use std::collections::{HashMap, HashSet};

/// Room membership for one channel. Every socket is implicitly a member of
/// the room named after its own id; only explicit joins are stored.
#[derive(Debug, Default)]
pub(crate) struct Rooms {
    members: HashMap<String, HashSet<String>>,
}

impl Rooms {
    pub(crate) fn join(&mut self, room: &str, socket_id: &str) -> bool {
        self.members
            .entry(room.to_string())
            .or_default()
            .insert(socket_id.to_string())
    }

    pub(crate) fn leave(&mut self, room: &str, socket_id: &str) -> bool {
        let Some(members) = self.members.get_mut(room) else {
            return false;
        };
        let removed = members.remove(socket_id);
        if members.is_empty() {
            self.members.remove(room);
        }
        removed
    }

    pub(crate) fn forget(&mut self, socket_id: &str) {
        self.members.retain(|_, members| {
            members.remove(socket_id);
            !members.is_empty()
        });
    }

    fn contains(&self, room: &str, socket_id: &str) -> bool {
        room == socket_id
            || self
                .members
                .get(room)
                .is_some_and(|members| members.contains(socket_id))
    }

    /// Sockets a broadcast reaches: members of any of `rooms` (everyone when
    /// `rooms` is empty) that are in none of `except`.
    pub(crate) fn targets<'a>(
        &self,
        live: impl Iterator<Item = &'a str>,
        rooms: &[String],
        except: &[String],
    ) -> Vec<&'a str> {
        live.filter(|socket_id| {
            let included =
                rooms.is_empty() || rooms.iter().any(|room| self.contains(room, socket_id));
            included && !except.iter().any(|room| self.contains(room, socket_id))
        })
        .collect()
    }
}
