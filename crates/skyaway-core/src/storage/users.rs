//! User directory bookkeeping. The lifecycle core only reads `enlisted` and
//! `banned`; the rest serves administrative commands.

use rusqlite::{params, OptionalExtension};

use crate::error::{CoreError, Result, StorageContext};
use crate::event::User;

use super::Database;

impl Database {
    /// Insert or update a user by id.
    pub fn put_user(&self, user: &User) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO botuser (id, username, first_name, last_name, enlisted, banned, admin)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    first_name = excluded.first_name,
                    last_name = excluded.last_name,
                    enlisted = excluded.enlisted,
                    banned = excluded.banned,
                    admin = excluded.admin",
                params![
                    user.id,
                    user.username,
                    user.first_name,
                    user.last_name,
                    user.enlisted,
                    user.banned,
                    user.admin,
                ],
            )
            .during("store user")?;
        Ok(())
    }

    pub fn user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM botuser WHERE id = ?1", User::COLUMNS),
                params![id],
                User::from_row,
            )
            .optional()
            .during("select user")
    }

    /// Look a user up by username, falling back to a numeric id.
    pub fn find_user(&self, identifier: &str) -> Result<Option<User>> {
        let by_name = self
            .conn
            .query_row(
                &format!("SELECT {} FROM botuser WHERE username = ?1", User::COLUMNS),
                params![identifier],
                User::from_row,
            )
            .optional()
            .during("select user by name")?;
        if by_name.is_some() {
            return Ok(by_name);
        }
        match identifier.parse::<i64>() {
            Ok(id) => self.user(id),
            Err(_) => Ok(None),
        }
    }

    pub fn users(&self, banned: bool) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM botuser WHERE banned = ?1 ORDER BY username",
                User::COLUMNS
            ))
            .during("prepare user query")?;
        let rows = stmt
            .query_map(params![banned], User::from_row)
            .during("select users")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .during("read users")
    }

    pub fn user_count(&self, banned: bool) -> Result<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM botuser WHERE banned = ?1",
                params![banned],
                |row| row.get(0),
            )
            .during("count users")
    }

    pub fn set_banned(&self, identifier: &str, banned: bool) -> Result<User> {
        self.update_user(identifier, |user| user.banned = banned)
    }

    pub fn set_enlisted(&self, identifier: &str, enlisted: bool) -> Result<User> {
        self.update_user(identifier, |user| user.enlisted = enlisted)
    }

    fn update_user(&self, identifier: &str, change: impl FnOnce(&mut User)) -> Result<User> {
        let mut user = self
            .find_user(identifier)?
            .ok_or_else(|| CoreError::UserNotFound(identifier.to_string()))?;
        change(&mut user);
        self.put_user(&user)?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_user_upserts() {
        let db = Database::open_memory().unwrap();
        let mut user = User::new(7, "bob");
        db.put_user(&user).unwrap();
        user.first_name = "Bob".into();
        user.enlisted = true;
        db.put_user(&user).unwrap();

        assert_eq!(db.user(7).unwrap(), Some(user));
        assert_eq!(db.user_count(false).unwrap(), 1);
    }

    #[test]
    fn find_by_name_or_id() {
        let db = Database::open_memory().unwrap();
        db.put_user(&User::new(7, "bob")).unwrap();
        assert_eq!(db.find_user("bob").unwrap().map(|u| u.id), Some(7));
        assert_eq!(db.find_user("7").unwrap().map(|u| u.id), Some(7));
        assert!(db.find_user("alice").unwrap().is_none());
    }

    #[test]
    fn ban_and_unban() {
        let db = Database::open_memory().unwrap();
        db.put_user(&User::new(1, "carol")).unwrap();
        db.put_user(&User::new(2, "dave")).unwrap();

        assert!(db.set_banned("carol", true).unwrap().banned);
        assert_eq!(db.user_count(true).unwrap(), 1);
        let names: Vec<String> = db.users(false).unwrap().into_iter().map(|u| u.username).collect();
        assert_eq!(names, vec!["dave".to_string()]);

        assert!(!db.set_banned("1", false).unwrap().banned);
        assert!(matches!(db.set_banned("nobody", true), Err(CoreError::UserNotFound(_))));
    }
}
