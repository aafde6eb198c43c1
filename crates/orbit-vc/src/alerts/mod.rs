use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    db::{FileTransaction, StoreError},
    detector::{Change, ModifiedBy},
    models::{AlertKind, NewAlert},
};

pub fn message_for(change: &Change, file_name: &str, version_no: Option<i64>) -> Option<(AlertKind, String)> {
    let version = version_no.map(|v| format!(" (version {v})")).unwrap_or_default();
    match change {
        Change::Created => Some((
            AlertKind::Created,
            format!("File {file_name} detected for the first time{version}"),
        )),
        Change::Modified(by) => Some((
            AlertKind::Modified,
            format!("File {file_name} changed: {}{version}", modified_reason(by)),
        )),
        Change::Deleted => Some((
            AlertKind::Deleted,
            format!("File {file_name} is missing or unreachable"),
        )),
        Change::Unchanged | Change::Missing => None,
    }
}

fn modified_reason(by: &ModifiedBy) -> &'static str {
    match (by.content, by.modified_time) {
        (true, true) => "content hash and modification time differ",
        (false, true) => "modification time differs",
        _ => "content hash differs",
    }
}

/// Writes the alert for `change`, if any, inside `tx`. DELETED is only written
/// while no uncleared DELETED alert exists for the file.
///
/// Returns `true` when a row was inserted.
pub async fn emit(
    tx: &mut dyn FileTransaction,
    file_id: Uuid,
    change: &Change,
    file_name: &str,
    version_no: Option<i64>,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let Some((kind, message)) = message_for(change, file_name, version_no) else {
        return Ok(false);
    };

    if kind == AlertKind::Deleted && tx.has_uncleared_alert(file_id, kind).await? {
        return Ok(false);
    }

    tx.insert_alert(&NewAlert {
        monitored_file_id: file_id,
        kind,
        message,
        created_at: at,
    })
    .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory::MemoryGateway, PersistenceGateway};

    #[test]
    fn modified_message_names_the_signal() {
        let (_, hash) = message_for(
            &Change::Modified(ModifiedBy { content: true, modified_time: false }),
            "f.txt",
            Some(2),
        )
        .unwrap();
        assert_eq!(hash, "File f.txt changed: content hash differs (version 2)");

        let (_, time) = message_for(
            &Change::Modified(ModifiedBy { content: false, modified_time: true }),
            "f.txt",
            Some(2),
        )
        .unwrap();
        assert!(time.contains("modification time differs"));

        let (kind, both) = message_for(
            &Change::Modified(ModifiedBy { content: true, modified_time: true }),
            "f.txt",
            None,
        )
        .unwrap();
        assert_eq!(kind, AlertKind::Modified);
        assert!(both.contains("content hash and modification time differ"));
    }

    #[test]
    fn quiet_outcomes_have_no_alert() {
        assert!(message_for(&Change::Unchanged, "f", None).is_none());
        assert!(message_for(&Change::Missing, "f", None).is_none());
    }

    #[tokio::test]
    async fn deleted_is_written_once_until_cleared() {
        let gateway = MemoryGateway::new();
        let device = gateway.add_device(&[]).await;
        let file_id = gateway.add_file(device, r"C:\f.txt").await;

        for _ in 0..2 {
            let mut tx = gateway.begin().await.unwrap();
            emit(tx.as_mut(), file_id, &Change::Deleted, "f.txt", None, Utc::now())
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(gateway.alerts(file_id).await.len(), 1);

        gateway.clear_alerts(file_id).await;
        let mut tx = gateway.begin().await.unwrap();
        let inserted = emit(tx.as_mut(), file_id, &Change::Deleted, "f.txt", None, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(inserted);
        assert_eq!(gateway.alerts(file_id).await.len(), 2);
    }

    #[tokio::test]
    async fn modifications_are_never_deduplicated() {
        let gateway = MemoryGateway::new();
        let device = gateway.add_device(&[]).await;
        let file_id = gateway.add_file(device, r"C:\f.txt").await;
        let change = Change::Modified(ModifiedBy { content: true, modified_time: false });

        let mut tx = gateway.begin().await.unwrap();
        assert!(emit(tx.as_mut(), file_id, &change, "f.txt", Some(2), Utc::now()).await.unwrap());
        assert!(emit(tx.as_mut(), file_id, &change, "f.txt", Some(3), Utc::now()).await.unwrap());
        tx.commit().await.unwrap();

        let alerts = gateway.alerts(file_id).await;
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.kind == AlertKind::Modified && !a.cleared));
    }
}
