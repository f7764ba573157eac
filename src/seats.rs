//! Replicated seat table.
//!
//! The table is a list of `nSeats` names, `""` meaning free. Seat numbers
//! are 1-based on the wire. The whole table travels as a JSON array of
//! strings in RELEASE and JOIN_RESPONSE messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::mutex::Application;

pub const FIELD_REQUEST: &str = "REQUEST";
pub const FIELD_NAME: &str = "NAME";
pub const FIELD_SEATNUM: &str = "SEATNUM";
pub const FIELD_MESSAGE: &str = "MESSAGE";

pub const INVALID_COMMAND: &str = "Invalid command";

/// Why a client request could not be turned into a [`SeatCommand`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("unknown request kind {0:?}")]
    UnknownKind(String),

    #[error("seat number {0:?} is not an integer")]
    BadSeatNumber(String),
}

/// One client operation on the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatCommand {
    /// Take the lowest free seat.
    Reserve { name: String },
    /// Take a specific seat.
    BookSeat { name: String, seat: i64 },
    Search { name: String },
    Delete { name: String },
}

impl SeatCommand {
    /// Decode the string map a client sends.
    pub fn parse(fields: &HashMap<String, String>) -> Result<Self, CommandError> {
        let kind = fields
            .get(FIELD_REQUEST)
            .ok_or(CommandError::MissingField(FIELD_REQUEST))?;
        let name = fields
            .get(FIELD_NAME)
            .filter(|name| !name.is_empty())
            .cloned()
            .ok_or(CommandError::MissingField(FIELD_NAME))?;

        match kind.as_str() {
            "RESERVE" => Ok(SeatCommand::Reserve { name }),
            "BOOKSEAT" => {
                let raw = fields
                    .get(FIELD_SEATNUM)
                    .ok_or(CommandError::MissingField(FIELD_SEATNUM))?;
                let seat = raw
                    .trim()
                    .parse()
                    .map_err(|_| CommandError::BadSeatNumber(raw.clone()))?;
                Ok(SeatCommand::BookSeat { name, seat })
            }
            "SEARCH" => Ok(SeatCommand::Search { name }),
            "DELETE" => Ok(SeatCommand::Delete { name }),
            other => Err(CommandError::UnknownKind(other.to_string())),
        }
    }
}

/// Answer to a client: a message and, for some outcomes, a seat number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatReply {
    pub message: String,
    pub seat: Option<i64>,
}

impl SeatReply {
    fn text(message: impl Into<String>) -> Self {
        SeatReply {
            message: message.into(),
            seat: None,
        }
    }

    fn with_seat(message: impl Into<String>, seat: i64) -> Self {
        SeatReply {
            message: message.into(),
            seat: Some(seat),
        }
    }

    pub fn invalid() -> Self {
        Self::text(INVALID_COMMAND)
    }

    /// Response map as sent on the wire.
    pub fn into_fields(self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_MESSAGE.to_string(), self.message);
        if let Some(seat) = self.seat {
            fields.insert(FIELD_SEATNUM.to_string(), seat.to_string());
        }
        fields
    }
}

/// The seat table. Callers must hold the critical section while applying
/// commands; the inner lock only guards against the link threads calling
/// [`Application::sync`].
pub struct SeatTable {
    seats: Mutex<Vec<String>>,
}

impl SeatTable {
    pub fn new(n_seats: usize) -> Self {
        SeatTable {
            seats: Mutex::new(vec![String::new(); n_seats]),
        }
    }

    fn seats(&self) -> MutexGuard<'_, Vec<String>> {
        self.seats.lock().expect("seat table poisoned")
    }

    /// Copy of the table, 0-based.
    pub fn snapshot(&self) -> Vec<String> {
        self.seats().clone()
    }

    pub fn n_seats(&self) -> usize {
        self.seats().len()
    }

    pub fn apply(&self, command: &SeatCommand) -> SeatReply {
        match command {
            SeatCommand::Reserve { name } => self.reserve(name),
            SeatCommand::BookSeat { name, seat } => self.book_seat(name, *seat),
            SeatCommand::Search { name } => self.search(name),
            SeatCommand::Delete { name } => self.delete(name),
        }
    }

    pub fn reserve(&self, name: &str) -> SeatReply {
        let mut seats = self.seats();
        if position_of(&seats, name).is_some() {
            return SeatReply::text("Seat already booked against name provided.");
        }
        match seats.iter().position(|holder| holder.is_empty()) {
            Some(free) => {
                seats[free] = name.to_string();
                let seat = free as i64 + 1;
                SeatReply::with_seat(format!("Seat assigned to you is {seat}"), seat)
            }
            None => SeatReply::with_seat("Sold out - no seat available.", -1),
        }
    }

    pub fn book_seat(&self, name: &str, seat: i64) -> SeatReply {
        let mut seats = self.seats();
        if let Some(held) = position_of(&seats, name) {
            let held = held as i64 + 1;
            if held == seat {
                return SeatReply::text("Seat already booked against name provided.");
            }
            return SeatReply::with_seat(
                format!("Seat {held} is already booked against name {name}"),
                held,
            );
        }

        let index = seat
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .filter(|&i| i < seats.len());
        match index {
            Some(i) if seats[i].is_empty() => {
                seats[i] = name.to_string();
                SeatReply::with_seat(format!("Seat assigned to you is {seat}"), seat)
            }
            _ => SeatReply::text(format!("Seat {seat} is not available.")),
        }
    }

    pub fn search(&self, name: &str) -> SeatReply {
        let seats = self.seats();
        match position_of(&seats, name) {
            Some(held) => {
                let seat = held as i64 + 1;
                SeatReply::with_seat(format!("Reserved seat for {name} is {seat}"), seat)
            }
            None => SeatReply::with_seat(format!("No reservation found for {name}"), -1),
        }
    }

    pub fn delete(&self, name: &str) -> SeatReply {
        let mut seats = self.seats();
        match position_of(&seats, name) {
            Some(held) => {
                seats[held].clear();
                SeatReply::text(format!("Reservation deleted for {name}"))
            }
            None => SeatReply::text(format!("No reservation found for {name}")),
        }
    }
}

/// Seat held by `name`. The empty name never holds a seat.
fn position_of(seats: &[String], name: &str) -> Option<usize> {
    if name.is_empty() {
        return None;
    }
    seats.iter().position(|holder| holder == name)
}

impl Application for SeatTable {
    fn serialized_state(&self) -> String {
        serde_json::to_string(&*self.seats()).expect("seat table serialization should not fail")
    }

    fn sync(&self, state: &str) {
        match serde_json::from_str::<Vec<String>>(state) {
            Ok(table) => {
                debug!(seats = table.len(), "seat table synced");
                *self.seats() = table;
            }
            Err(e) => warn!(error = %e, "ignoring malformed seat table"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_reserve_takes_lowest_free_seat() {
        let table = SeatTable::new(3);
        assert_eq!(table.reserve("ann").seat, Some(1));
        assert_eq!(table.reserve("bob").seat, Some(2));
        table.delete("ann");

        let reply = table.reserve("cy");
        assert_eq!(reply.message, "Seat assigned to you is 1");
        assert_eq!(reply.seat, Some(1));
    }

    #[test]
    fn test_reserve_twice_and_sold_out() {
        let table = SeatTable::new(1);
        table.reserve("ann");

        let again = table.reserve("ann");
        assert_eq!(again.message, "Seat already booked against name provided.");
        assert_eq!(again.seat, None);

        let full = table.reserve("bob");
        assert_eq!(full.message, "Sold out - no seat available.");
        assert_eq!(full.seat, Some(-1));
    }

    #[test]
    fn test_book_specific_seat() {
        let table = SeatTable::new(5);
        let reply = table.book_seat("ann", 4);
        assert_eq!(reply.message, "Seat assigned to you is 4");
        assert_eq!(table.snapshot()[3], "ann");

        // Same seat again by the same name.
        let same = table.book_seat("ann", 4);
        assert_eq!(same.message, "Seat already booked against name provided.");

        // A different seat while already holding one.
        let other = table.book_seat("ann", 2);
        assert_eq!(other.message, "Seat 4 is already booked against name ann");
        assert_eq!(other.seat, Some(4));

        let taken = table.book_seat("bob", 4);
        assert_eq!(taken.message, "Seat 4 is not available.");
    }

    #[test]
    fn test_book_seat_out_of_range() {
        let table = SeatTable::new(2);
        assert_eq!(table.book_seat("ann", 0).message, "Seat 0 is not available.");
        assert_eq!(table.book_seat("ann", 3).message, "Seat 3 is not available.");
        assert_eq!(table.book_seat("ann", -7).message, "Seat -7 is not available.");
        assert!(table.snapshot().iter().all(String::is_empty));
    }

    #[test]
    fn test_search_and_delete() {
        let table = SeatTable::new(2);
        let missing = table.search("ann");
        assert_eq!(missing.message, "No reservation found for ann");
        assert_eq!(missing.seat, Some(-1));

        table.book_seat("ann", 2);
        let found = table.search("ann");
        assert_eq!(found.message, "Reserved seat for ann is 2");
        assert_eq!(found.seat, Some(2));

        assert_eq!(table.delete("ann").message, "Reservation deleted for ann");
        assert_eq!(table.delete("ann").message, "No reservation found for ann");
        assert_eq!(table.delete("ann").seat, None);
    }

    #[test]
    fn test_state_blob_round_trip() {
        let table = SeatTable::new(3);
        table.book_seat("ann", 2);
        let blob = table.serialized_state();
        assert_eq!(blob, r#"["","ann",""]"#);

        let replica = SeatTable::new(3);
        replica.sync(&blob);
        assert_eq!(replica.snapshot(), table.snapshot());
    }

    #[test]
    fn test_malformed_sync_keeps_table() {
        let table = SeatTable::new(2);
        table.reserve("ann");
        table.sync("{not a table");
        assert_eq!(table.snapshot(), vec!["ann".to_string(), String::new()]);
    }

    #[test]
    fn test_parse_commands() {
        let reserve = fields(&[("REQUEST", "RESERVE"), ("NAME", "ann")]);
        assert_eq!(
            SeatCommand::parse(&reserve),
            Ok(SeatCommand::Reserve { name: "ann".into() })
        );

        let book = fields(&[("REQUEST", "BOOKSEAT"), ("NAME", "ann"), ("SEATNUM", "3")]);
        assert_eq!(
            SeatCommand::parse(&book),
            Ok(SeatCommand::BookSeat { name: "ann".into(), seat: 3 })
        );
        assert_eq!(
            SeatCommand::parse(&fields(&[("REQUEST", "DELETE"), ("NAME", "x"), ("SEATNUM", "9")])),
            Ok(SeatCommand::Delete { name: "x".into() })
        );
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        let unknown = fields(&[("REQUEST", "UPGRADE"), ("NAME", "ann")]);
        assert_eq!(
            SeatCommand::parse(&unknown),
            Err(CommandError::UnknownKind("UPGRADE".into()))
        );

        let no_seat = fields(&[("REQUEST", "BOOKSEAT"), ("NAME", "ann")]);
        assert_eq!(
            SeatCommand::parse(&no_seat),
            Err(CommandError::MissingField(FIELD_SEATNUM))
        );

        let bad_seat = fields(&[("REQUEST", "BOOKSEAT"), ("NAME", "ann"), ("SEATNUM", "two")]);
        assert!(matches!(
            SeatCommand::parse(&bad_seat),
            Err(CommandError::BadSeatNumber(_))
        ));

        let no_name = fields(&[("REQUEST", "SEARCH")]);
        assert_eq!(
            SeatCommand::parse(&no_name),
            Err(CommandError::MissingField(FIELD_NAME))
        );
        let empty_name = fields(&[("REQUEST", "RESERVE"), ("NAME", "")]);
        assert_eq!(
            SeatCommand::parse(&empty_name),
            Err(CommandError::MissingField(FIELD_NAME))
        );
    }

    #[test]
    fn test_reply_fields() {
        let fields = SeatReply::with_seat("Seat assigned to you is 1", 1).into_fields();
        assert_eq!(fields[FIELD_MESSAGE], "Seat assigned to you is 1");
        assert_eq!(fields[FIELD_SEATNUM], "1");
        assert!(!SeatReply::invalid().into_fields().contains_key(FIELD_SEATNUM));
    }
}
