//! Generated wire types for the `holdfast` proto package, plus the small
//! constructors both ends of the hold streams lean on.

#![allow(missing_docs)]

tonic::include_proto!("holdfast");

impl HoldEvent {
    pub fn granted(granted: bool) -> Self {
        Self {
            event: Some(hold_event::Event::Granted(granted)),
        }
    }

    pub fn pong(id: u64) -> Self {
        Self {
            event: Some(hold_event::Event::Pong(id)),
        }
    }
}

impl LockHoldRequest {
    pub fn open(name: impl Into<String>, nowait: bool) -> Self {
        Self {
            msg: Some(lock_hold_request::Msg::Open(LockOpen {
                name: name.into(),
                nowait,
            })),
        }
    }

    pub fn ping(ping: Ping) -> Self {
        Self {
            msg: Some(lock_hold_request::Msg::Ping(ping)),
        }
    }
}

impl SlotHoldRequest {
    pub fn open(object_id: impl Into<String>, max_slots: u32, slot_id: impl Into<String>) -> Self {
        Self {
            msg: Some(slot_hold_request::Msg::Open(SlotOpen {
                object_id: object_id.into(),
                max_slots,
                slot_id: slot_id.into(),
            })),
        }
    }

    pub fn ping(ping: Ping) -> Self {
        Self {
            msg: Some(slot_hold_request::Msg::Ping(ping)),
        }
    }
}

impl SyncEvent {
    pub fn init(seq: u64, objects: Vec<ObjectSnapshot>) -> Self {
        Self {
            seq,
            event: Some(sync_event::Event::Init(InitSnapshot { objects })),
        }
    }

    pub fn update(seq: u64, snapshot: ObjectSnapshot) -> Self {
        Self {
            seq,
            event: Some(sync_event::Event::Update(snapshot)),
        }
    }

    pub fn deleted(seq: u64, id: impl Into<String>) -> Self {
        Self {
            seq,
            event: Some(sync_event::Event::Deleted(id.into())),
        }
    }
}
