// tests/session_lifecycle.rs
// Drives a full session through the public API: setup, chaining,
// payoffs, display, and teardown.

use lablink::config::EnvConfig;
use lablink::db::{Database, NewSession, UserRole};
use lablink::utils::add_params_to_url;

fn build_session(db: &Database) -> (i64, i64, Vec<i64>, Vec<i64>) {
    let session_id = db
        .create_session(&NewSession {
            session_type: Some("public_goods".to_string()),
            label: Some("lab evening run".to_string()),
            base_pay: 100,
            ..NewSession::default()
        })
        .unwrap();

    let experimenter_id = db.create_experimenter().unwrap();
    db.attach_experimenter(session_id, experimenter_id).unwrap();

    let apps = ["dictator", "trust", "public_goods"];
    let subsession_ids: Vec<i64> = apps
        .iter()
        .map(|app| db.create_subsession(app, None).unwrap())
        .collect();
    for &subsession_id in &subsession_ids {
        db.create_treatment(subsession_id, Some("baseline")).unwrap();
        db.add_subsession(session_id, subsession_id).unwrap();
    }
    db.chain_subsessions(session_id, &subsession_ids).unwrap();

    let participant_ids: Vec<i64> = (0..2)
        .map(|k| {
            db.create_participant(session_id, Some(&format!("P{}", k + 1)))
                .unwrap()
        })
        .collect();
    for &subsession_id in &subsession_ids {
        for &participant_id in &participant_ids {
            db.create_participant_record(subsession_id, Some(participant_id))
                .unwrap();
        }
        db.create_experimenter_record(subsession_id).unwrap();
    }
    db.chain_participants(session_id).unwrap();
    db.chain_experimenters(session_id).unwrap();
    db.mark_ready(session_id).unwrap();

    (session_id, experimenter_id, subsession_ids, participant_ids)
}

#[test]
fn full_session_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("lab.db")).unwrap();
    let (session_id, experimenter_id, subsession_ids, participant_ids) = build_session(&db);

    // Chain shape
    let chain = db.subsessions(session_id).unwrap();
    assert_eq!(
        chain.iter().map(|s| s.id).collect::<Vec<_>>(),
        subsession_ids
    );
    assert_eq!(
        chain.iter().map(|s| s.index_in_subsessions).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(
        db.subsession_names(session_id).unwrap(),
        format!(
            "Dictator #{}, Trust #{}, Public Goods #{}",
            subsession_ids[0], subsession_ids[1], subsession_ids[2]
        )
    );
    let session = db.get_session(session_id).unwrap().unwrap();
    assert!(session.ready);
    assert_eq!(session.base_pay_display(), "$1.00");

    // Start the session and let actors in
    db.start_session(session_id).unwrap();
    db.record_experimenter_visit(experimenter_id, None).unwrap();
    for &participant_id in &participant_ids {
        db.record_participant_visit(participant_id, Some("10.1.1.1"))
            .unwrap();
    }
    assert!(
        db.get_session(session_id)
            .unwrap()
            .unwrap()
            .time_started
            .is_some()
    );

    // Start links
    let participant = db.get_participant(participant_ids[0]).unwrap().unwrap();
    let config = EnvConfig::from_env();
    let start_link = lablink::utils::absolute_url(&config.base_url, &participant.start_url())
        .unwrap();
    let labeled = add_params_to_url(&start_link, &[("participant_label", "P1")]).unwrap();
    assert!(labeled.contains("/InitializeSessionParticipant/"));
    assert!(labeled.ends_with("participant_label=P1"));

    let experimenter = db.get_experimenter(experimenter_id).unwrap().unwrap();
    assert!(experimenter.start_url().ends_with('/'));

    // Experimenter chain spans every stage
    let experimenter_chain = db.experimenter_users(experimenter_id).unwrap();
    assert_eq!(experimenter_chain.len(), subsession_ids.len());
    assert!(
        experimenter_chain
            .iter()
            .all(|r| r.role == UserRole::Experimenter)
    );

    // Payoffs: [5, None, 3] for the first participant
    let records = db.participant_users(participant_ids[0]).unwrap();
    db.set_payoff(records[0].id, Some(5)).unwrap();
    db.set_payoff(records[2].id, Some(3)).unwrap();
    assert_eq!(db.payoff_from_subsessions(participant_ids[0]).unwrap(), 8);
    assert!(
        !db.payoff_from_subsessions_is_complete(participant_ids[0])
            .unwrap()
    );
    assert_eq!(
        db.total_pay_display(participant_ids[0]),
        "$1.08 (incomplete)"
    );
    assert!(!db.payments_ready(session_id).unwrap());

    // Complete all payoffs
    db.set_payoff(records[1].id, Some(0)).unwrap();
    for &participant_id in &participant_ids[1..] {
        for record in db.participant_users(participant_id).unwrap() {
            db.set_payoff(record.id, Some(10)).unwrap();
        }
    }
    assert_eq!(db.total_pay(participant_ids[0]).unwrap(), 108);
    assert_eq!(db.total_pay_display(participant_ids[0]), "$1.08");
    assert!(db.payments_ready(session_id).unwrap());

    // Progress display for a participant midway through
    db.set_participant_subsession_index(participant_ids[0], 1)
        .unwrap();
    assert_eq!(
        db.subsessions_completed(participant_ids[0])
            .unwrap()
            .as_deref(),
        Some("1/3 subsessions")
    );
    assert_eq!(
        db.current_subsession(participant_ids[0]).unwrap().as_deref(),
        Some("Trust")
    );

    // Open-session singleton
    db.set_open_session(Some(session_id)).unwrap();
    assert_eq!(db.open_session().unwrap().unwrap().id, session_id);

    // Teardown cascades through the chain
    db.delete_session(session_id).unwrap();
    assert!(db.get_session(session_id).unwrap().is_none());
    for &subsession_id in &subsession_ids {
        assert!(db.get_subsession(subsession_id).unwrap().is_none());
    }
    for &participant_id in &participant_ids {
        assert!(db.get_participant(participant_id).unwrap().is_none());
    }
    assert!(db.open_session().unwrap().is_none());
    // The experimenter row outlives the session; its chain is cleared
    assert!(db.experimenter_users(experimenter_id).unwrap().is_empty());
}
