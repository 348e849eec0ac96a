use shuttle_transfer::{FailureReason, Fault};

use crate::*;

fn one_record() -> MemorySource {
    MemorySource::new(vec![Item::Record(TypedRecord::new(
        shuttle_core::RecordType::User,
        serde_json::json!({ "user_id": USER }),
    ))])
}

/// Receiver typed the wrong code: sender rejects, receiver is told to stop.
#[tokio::test]
async fn test_wrong_code_is_rejected() -> Result<()> {
    let key = test_key();
    let mut receiver = Side::new(&key);
    receiver.credentials = PairingCredentials::new(USER, (CODE + 1) % 1000);

    let sink = MemorySink::default();
    let outcome = run_session(Side::new(&key), receiver, one_record(), sink.clone()).await?;

    assert!(matches!(outcome.server, Err(TransferError::Rejected(FailureReason::MismatchedCode))));
    assert_eq!(outcome.server_state, TransferState::Failed(FailureReason::MismatchedCode));
    assert!(matches!(outcome.client, Err(TransferError::RemoteCancelled)));
    assert_eq!(
        outcome.client_state,
        TransferState::Failed(FailureReason::Exception(Fault::Cancelled))
    );
    assert!(sink.0.lock().records.is_empty());
    Ok(())
}

/// Another account's device cannot pull the snapshot even with the code.
#[tokio::test]
async fn test_wrong_user_is_rejected() -> Result<()> {
    let key = test_key();
    let mut receiver = Side::new(&key);
    receiver.credentials = PairingCredentials::new("mallory", CODE);

    let outcome = run_session(Side::new(&key), receiver, one_record(), MemorySink::default()).await?;

    assert_eq!(outcome.server_state, TransferState::Failed(FailureReason::MismatchedUserId));
    assert!(matches!(outcome.client_state, TransferState::Failed(_)));
    Ok(())
}

/// A receiver holding a different transfer key fails authentication on its
/// very first frame.
#[tokio::test]
async fn test_wrong_key_is_tampered() -> Result<()> {
    let sink = MemorySink::default();
    let outcome = run_session(
        Side::new(&test_key()),
        Side::new(&test_key()),
        one_record(),
        sink.clone(),
    )
    .await?;

    let server_err = outcome.server.expect_err("server must fail");
    assert!(server_err.is_authenticity_failure(), "got {server_err:?}");
    assert_eq!(
        outcome.server_state,
        TransferState::Failed(FailureReason::Exception(Fault::Tampered))
    );
    assert!(matches!(outcome.client_state, TransferState::Failed(_)));
    assert!(sink.0.lock().records.is_empty());
    Ok(())
}
