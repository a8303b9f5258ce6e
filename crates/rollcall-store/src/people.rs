//! The `people` table: hub face id → person on a remote roster.

use crate::kv::{self, KvValue, Namespace};
use crate::StoreError;
use rollcall_core::{FaceId, PersonFaceMapping, Role};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub type Person = PersonFaceMapping;

/// Fields a metadata-only resync may change. `None` leaves the column as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersonUpdate {
    pub display_name: Option<String>,
    pub org_id: Option<String>,
    pub org_name: Option<String>,
    pub source_image_url: Option<String>,
    pub photo_digest: Option<String>,
}

const COLUMNS: &str = "face_id, external_id, display_name, role, org_id, org_name, \
                       source_image_url, photo_digest, updated_at";

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn row_to_person(row: &Row<'_>) -> rusqlite::Result<Person> {
    let role: String = row.get(3)?;
    let role = role.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Person {
        face_id: row.get(0)?,
        external_id: row.get(1)?,
        display_name: row.get(2)?,
        role,
        org_id: row.get(4)?,
        org_name: row.get(5)?,
        source_image_url: row.get(6)?,
        photo_digest: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn query(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Person>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM people {filter} ORDER BY face_id");
    let mut stmt = conn.prepare(&sql)?;
    let people = stmt
        .query_map(args, row_to_person)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(people)
}

/// Insert or replace the row keyed by `person.face_id`.
///
/// A row for the same `(external_id, role)` under another face id is replaced
/// too, keeping one mapping per person.
pub fn upsert_person(conn: &Connection, person: &Person) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO people
         (face_id, external_id, display_name, role, org_id, org_name, source_image_url,
          photo_digest, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            person.face_id,
            person.external_id,
            person.display_name,
            person.role.as_str(),
            person.org_id,
            person.org_name,
            person.source_image_url,
            person.photo_digest,
            now(),
        ],
    )?;
    Ok(())
}

pub fn update_person_by_face_id(
    conn: &Connection,
    face_id: FaceId,
    update: &PersonUpdate,
) -> Result<usize, StoreError> {
    let rows = conn.execute(
        "UPDATE people SET
            display_name     = COALESCE(?2, display_name),
            org_id           = COALESCE(?3, org_id),
            org_name         = COALESCE(?4, org_name),
            source_image_url = COALESCE(?5, source_image_url),
            photo_digest     = COALESCE(?6, photo_digest),
            updated_at       = ?7
         WHERE face_id = ?1",
        params![
            face_id,
            update.display_name,
            update.org_id,
            update.org_name,
            update.source_image_url,
            update.photo_digest,
            now(),
        ],
    )?;
    Ok(rows)
}

pub fn get_by_face_id(conn: &Connection, face_id: FaceId) -> Result<Option<Person>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM people WHERE face_id = ?1");
    Ok(conn.query_row(&sql, [face_id], row_to_person).optional()?)
}

pub fn query_by_external_id(
    conn: &Connection,
    external_id: &str,
    role: Role,
) -> Result<Option<Person>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM people WHERE external_id = ?1 AND role = ?2");
    Ok(conn
        .query_row(&sql, params![external_id, role.as_str()], row_to_person)
        .optional()?)
}

pub fn query_by_org_id(conn: &Connection, org_id: &str) -> Result<Vec<Person>, StoreError> {
    query(conn, "WHERE org_id = ?1", [org_id])
}

pub fn query_by_role(conn: &Connection, role: Role) -> Result<Vec<Person>, StoreError> {
    query(conn, "WHERE role = ?1", [role.as_str()])
}

pub fn list_all(conn: &Connection) -> Result<Vec<Person>, StoreError> {
    query(conn, "", [])
}

pub fn count_by_role(conn: &Connection, role: Role) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM people WHERE role = ?1",
        [role.as_str()],
        |row| row.get(0),
    )?)
}

pub fn delete_by_face_id(conn: &Connection, face_id: FaceId) -> Result<usize, StoreError> {
    Ok(conn.execute("DELETE FROM people WHERE face_id = ?1", [face_id])?)
}

/// Delete every row of an org, dropping their `face_mapping` keys as well.
pub fn delete_by_org_id(conn: &mut Connection, org_id: &str) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    for person in query(&tx, "WHERE org_id = ?1", [org_id])? {
        kv::delete(
            &tx,
            Namespace::FaceMapping,
            &Person::mapping_key(&person.external_id, person.role),
        )?;
    }
    let rows = tx.execute("DELETE FROM people WHERE org_id = ?1", [org_id])?;
    tx.commit()?;
    Ok(rows)
}

/// Persist a mapping row and its `face_mapping` key in one transaction.
pub fn record_mapping(conn: &mut Connection, person: &Person) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    upsert_person(&tx, person)?;
    kv::set(
        &tx,
        Namespace::FaceMapping,
        &Person::mapping_key(&person.external_id, person.role),
        &KvValue::from(person.face_id),
    )?;
    tx.commit()?;
    Ok(())
}

/// Remove a mapping row and its `face_mapping` key in one transaction.
///
/// Returns the removed row, if there was one.
pub fn forget_mapping(
    conn: &mut Connection,
    face_id: FaceId,
) -> Result<Option<Person>, StoreError> {
    let tx = conn.transaction()?;
    let person = get_by_face_id(&tx, face_id)?;
    if let Some(p) = &person {
        let key = Person::mapping_key(&p.external_id, p.role);
        // Only drop the key if it still points at this face.
        if kv::get(&tx, Namespace::FaceMapping, &key)?.and_then(|v| v.as_i64()) == Some(face_id) {
            kv::delete(&tx, Namespace::FaceMapping, &key)?;
        }
        delete_by_face_id(&tx, face_id)?;
    }
    tx.commit()?;
    Ok(person)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::migrations;

    pub(crate) fn person(face_id: FaceId, external_id: &str, role: Role, org: &str) -> Person {
        Person {
            face_id,
            external_id: external_id.to_string(),
            display_name: format!("Person {external_id}"),
            role,
            org_id: org.to_string(),
            org_name: format!("Org {org}"),
            source_image_url: format!("https://cdn.example/{external_id}.jpg"),
            photo_digest: Some("abc".into()),
            updated_at: String::new(),
        }
    }

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrations::migrate(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_upsert_and_get() {
        let c = conn();
        upsert_person(&c, &person(10, "S1", Role::Student, "org1")).unwrap();
        let got = get_by_face_id(&c, 10).unwrap().unwrap();
        assert_eq!(got.external_id, "S1");
        assert_eq!(got.role, Role::Student);
        assert!(!got.updated_at.is_empty());
        assert!(get_by_face_id(&c, 11).unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_same_face_id() {
        let c = conn();
        upsert_person(&c, &person(10, "S1", Role::Student, "org1")).unwrap();
        let mut p = person(10, "S1", Role::Student, "org1");
        p.display_name = "Renamed".into();
        upsert_person(&c, &p).unwrap();
        assert_eq!(list_all(&c).unwrap().len(), 1);
        assert_eq!(get_by_face_id(&c, 10).unwrap().unwrap().display_name, "Renamed");
    }

    #[test]
    fn test_one_row_per_external_id_and_role() {
        let c = conn();
        upsert_person(&c, &person(10, "S1", Role::Student, "org1")).unwrap();
        upsert_person(&c, &person(11, "S1", Role::Student, "org1")).unwrap();
        upsert_person(&c, &person(12, "S1", Role::Teacher, "org1")).unwrap();

        let all = list_all(&c).unwrap();
        assert_eq!(all.iter().map(|p| p.face_id).collect::<Vec<_>>(), vec![11, 12]);
        assert_eq!(query_by_external_id(&c, "S1", Role::Student).unwrap().unwrap().face_id, 11);
    }

    #[test]
    fn test_update_by_face_id_partial() {
        let c = conn();
        upsert_person(&c, &person(10, "S1", Role::Student, "org1")).unwrap();
        let update = PersonUpdate {
            display_name: Some("New Name".into()),
            ..Default::default()
        };
        assert_eq!(update_person_by_face_id(&c, 10, &update).unwrap(), 1);
        assert_eq!(update_person_by_face_id(&c, 99, &update).unwrap(), 0);

        let got = get_by_face_id(&c, 10).unwrap().unwrap();
        assert_eq!(got.display_name, "New Name");
        assert_eq!(got.org_id, "org1");
        assert_eq!(got.photo_digest.as_deref(), Some("abc"));
    }

    #[test]
    fn test_queries_by_org_and_role() {
        let c = conn();
        upsert_person(&c, &person(1, "A", Role::Student, "org1")).unwrap();
        upsert_person(&c, &person(2, "B", Role::Teacher, "org1")).unwrap();
        upsert_person(&c, &person(3, "C", Role::Student, "org2")).unwrap();

        assert_eq!(query_by_org_id(&c, "org1").unwrap().len(), 2);
        assert_eq!(query_by_role(&c, Role::Student).unwrap().len(), 2);
        assert_eq!(count_by_role(&c, Role::Teacher).unwrap(), 1);
        assert!(query_by_org_id(&c, "none").unwrap().is_empty());
    }

    #[test]
    fn test_delete_by_face_id_and_org() {
        let mut c = conn();
        record_mapping(&mut c, &person(1, "A", Role::Student, "org1")).unwrap();
        record_mapping(&mut c, &person(2, "B", Role::Student, "org1")).unwrap();
        record_mapping(&mut c, &person(3, "C", Role::Student, "org2")).unwrap();

        assert_eq!(delete_by_face_id(&c, 3).unwrap(), 1);
        assert_eq!(delete_by_face_id(&c, 3).unwrap(), 0);
        assert_eq!(delete_by_org_id(&mut c, "org1").unwrap(), 2);
        assert!(list_all(&c).unwrap().is_empty());
        assert_eq!(kv::list_keys(&c, Namespace::FaceMapping).unwrap(), vec!["C_student"]);
    }

    #[test]
    fn test_record_and_forget_mapping_keep_kv_in_step() {
        let mut c = conn();
        record_mapping(&mut c, &person(7, "S9", Role::Student, "org1")).unwrap();
        assert_eq!(
            kv::get(&c, Namespace::FaceMapping, "S9_student").unwrap().and_then(|v| v.as_i64()),
            Some(7)
        );

        let removed = forget_mapping(&mut c, 7).unwrap().unwrap();
        assert_eq!(removed.external_id, "S9");
        assert!(get_by_face_id(&c, 7).unwrap().is_none());
        assert!(kv::get(&c, Namespace::FaceMapping, "S9_student").unwrap().is_none());
        assert!(forget_mapping(&mut c, 7).unwrap().is_none());
    }

    #[test]
    fn test_forget_stale_face_keeps_newer_key() {
        let mut c = conn();
        record_mapping(&mut c, &person(7, "S9", Role::Student, "org1")).unwrap();
        // Point the key at a newer face without touching row 7.
        kv::set(&c, Namespace::FaceMapping, "S9_student", &KvValue::from(8i64)).unwrap();
        forget_mapping(&mut c, 7).unwrap();
        assert_eq!(
            kv::get(&c, Namespace::FaceMapping, "S9_student").unwrap().and_then(|v| v.as_i64()),
            Some(8)
        );
    }
}
