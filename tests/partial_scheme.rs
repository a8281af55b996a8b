use capture_override::Usecase::Slots::{
    FrameSlotTable, MetadataProgress, RequestSlot, SlotState,
};
use capture_override::Usecase::{PartialMetaSupport, PartialScheme, PartialStage};

#[test]
fn test_stage_mapping() {
    use PartialStage::*;

    let single = PartialScheme::new(1, PartialMetaSupport::NoSupport);
    assert_eq!(single.stage_of(1), Some(Final));
    assert_eq!(single.stage_of(2), None);

    let driver = PartialScheme::new(2, PartialMetaSupport::NoSupport);
    assert_eq!(driver.stage_of(1), Some(DriverPartial));
    assert_eq!(driver.stage_of(2), Some(Final));

    let combined = PartialScheme::new(2, PartialMetaSupport::Combined);
    assert_eq!(combined.stage_of(1), Some(DriverPartial));

    let separate = PartialScheme::new(2, PartialMetaSupport::Separate);
    assert_eq!(separate.stage_of(1), Some(ChiPartial));
    assert_eq!(separate.ordinal_of(DriverPartial), None);

    let triple = PartialScheme::new(3, PartialMetaSupport::Separate);
    assert_eq!(triple.stage_of(1), Some(ChiPartial));
    assert_eq!(triple.stage_of(2), Some(DriverPartial));
    assert_eq!(triple.stage_of(3), Some(Final));
    assert_eq!(triple.ordinal_of(Final), Some(3));

    for scheme in [single, driver, separate, triple] {
        assert_eq!(scheme.stage_of(0), None, "ordinal 0 carries no metadata");
        assert_eq!(scheme.stage_of(4), None);
    }
}

#[test]
fn test_stage_count_is_clamped() {
    assert_eq!(PartialScheme::new(0, PartialMetaSupport::NoSupport).stage_count(), 1);
    assert_eq!(PartialScheme::new(7, PartialMetaSupport::NoSupport).stage_count(), 3);
}

#[test]
fn test_final_backfills_earlier_stages() {
    let triple = PartialScheme::new(3, PartialMetaSupport::NoSupport);
    let mut progress = MetadataProgress::default();
    triple.mark_sent(&mut progress, PartialStage::Final);
    assert!(progress.driver_partial && progress.chi_partial && progress.final_sent);

    let separate = PartialScheme::new(2, PartialMetaSupport::Separate);
    let mut progress = MetadataProgress::default();
    separate.mark_sent(&mut progress, PartialStage::Final);
    assert!(progress.chi_partial);
    assert!(!progress.driver_partial);

    let driver = PartialScheme::new(2, PartialMetaSupport::NoSupport);
    let mut progress = MetadataProgress::default();
    driver.mark_sent(&mut progress, PartialStage::Final);
    assert!(progress.driver_partial);
    assert!(!progress.chi_partial);

    let combined = PartialScheme::new(2, PartialMetaSupport::Combined);
    let mut progress = MetadataProgress::default();
    combined.mark_sent(&mut progress, PartialStage::DriverPartial);
    assert!(progress.chi_partial, "combined partial covers both stages");
    assert!(!progress.final_sent);
}

#[test]
fn test_can_send_rules() {
    let scheme = PartialScheme::new(3, PartialMetaSupport::NoSupport);
    let mut progress = MetadataProgress::default();
    assert!(scheme.can_send(&progress, PartialStage::DriverPartial));

    scheme.mark_sent(&mut progress, PartialStage::DriverPartial);
    assert!(!scheme.can_send(&progress, PartialStage::DriverPartial));
    assert!(scheme.can_send(&progress, PartialStage::ChiPartial));
    assert!(scheme.can_send(&progress, PartialStage::Final));

    let mut errored = MetadataProgress {
        error_sent: true,
        ..MetadataProgress::default()
    };
    assert!(!scheme.can_send(&errored, PartialStage::Final));
    errored.error_sent = false;
    errored.final_sent = true;
    assert!(!scheme.can_send(&errored, PartialStage::ChiPartial));
    assert!(errored.is_done());
}

#[test]
fn test_slot_predicates() {
    let mut slot = RequestSlot::default();
    assert_eq!(slot.state, SlotState::Idle);
    assert!(!slot.is_occupied());
    assert!(!slot.holds(0));

    slot.state = SlotState::PartiallyResolved;
    slot.internal_frame = 4;
    slot.counters.total_output = 2;
    assert!(slot.holds(4));
    assert!(!slot.holds(12));
    assert!(slot.all_buffers_returned());
    assert!(!slot.is_settled());

    slot.metadata.error_sent = true;
    assert!(
        !slot.is_terminally_errored(),
        "good buffers still owe a shutter"
    );
    slot.buffer_error_sent = true;
    assert!(slot.no_more_valid_buffers());
    assert!(slot.is_terminally_errored());

    slot.counters.pending_output = 1;
    slot.counters.buffer_errors = 1;
    assert!(!slot.no_more_valid_buffers(), "one buffer may still come back");
    slot.counters.buffer_errors = 2;
    assert!(slot.is_terminally_errored());

    slot.state = SlotState::Error;
    assert!(slot.in_error());
    assert!(slot.is_settled());
}

#[test]
fn test_slot_table_indexing() {
    let table = FrameSlotTable::new(0);
    assert_eq!(table.capacity(), 1, "zero capacity is raised to one");

    let table = FrameSlotTable::new(8);
    assert_eq!(table.index_of(3), 3);
    assert_eq!(table.index_of(11), 3);
    assert!(table.lookup(3).is_none());
    assert!(table.to_internal(3).is_none());
    assert!(table.occupied_frames().is_empty());
    assert!(!table.counters().is_started());
    println!("Slot table: {:?}", table);
}
