use std::io::{self, Read, Write};
use std::sync::Arc;

use sb_shm::DPool;

use crate::session::{Session, SessionCookie, WidgetSession};
use crate::session_id::SessionId;

/// Record grammar grounded exactly on `original_source/src/session_write.cxx`
/// / `session_read.cxx`: 32-bit magic tags delimit records, strings are
/// 16-bit length-prefixed with `0xFFFF` meaning null (distinct from `0`,
/// an empty-but-defined string). Loading aborts the whole file — not just
/// one record — on any magic mismatch (spec §4.5).
const MAGIC_FILE: u32 = 0x5344_4600;
const MAGIC_SESSION: u32 = 0x5344_4601;
const MAGIC_WIDGET_SESSION: u32 = 0x5344_4602;
const MAGIC_COOKIE: u32 = 0x5344_4603;
const MAGIC_END_OF_RECORD: u32 = 0x5344_4604;
const MAGIC_END_OF_LIST: u32 = 0x5344_4605;

const NULL_STRING_LEN: u16 = 0xFFFF;

fn bad_magic(expected: u32, got: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("session file: expected magic {expected:#x}, got {got:#x}"),
    )
}

fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn write_bool(w: &mut impl Write, v: bool) -> io::Result<()> {
    write_u8(w, v as u8)
}

fn write_u16(w: &mut impl Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_magic(w: &mut impl Write, magic: u32) -> io::Result<()> {
    write_u32(w, magic)
}

fn write_bytes(w: &mut impl Write, data: Option<&[u8]>) -> io::Result<()> {
    match data {
        None => write_u16(w, NULL_STRING_LEN),
        Some(bytes) => {
            assert!(bytes.len() < NULL_STRING_LEN as usize, "buffer too long to persist");
            write_u16(w, bytes.len() as u16)?;
            w.write_all(bytes)
        }
    }
}

fn write_string(w: &mut impl Write, s: Option<&str>) -> io::Result<()> {
    write_bytes(w, s.map(|s| s.as_bytes()))
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_bool(r: &mut impl Read) -> io::Result<bool> {
    Ok(read_u8(r)? != 0)
}

fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_magic(r: &mut impl Read, expected: u32) -> io::Result<()> {
    let got = read_u32(r)?;
    if got != expected {
        return Err(bad_magic(expected, got));
    }
    Ok(())
}

fn read_bytes(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let len = read_u16(r)?;
    if len == NULL_STRING_LEN {
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn read_string(r: &mut impl Read) -> io::Result<Option<String>> {
    match read_bytes(r)? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}

fn write_widget_session(w: &mut impl Write, ws: &WidgetSession) -> io::Result<()> {
    write_string(w, Some(&ws.id))?;
    write_widget_sessions(w, &ws.children)?;
    write_string(w, ws.path_info.as_deref())?;
    write_string(w, ws.query_string.as_deref())?;
    write_magic(w, MAGIC_END_OF_RECORD)
}

fn write_widget_sessions(w: &mut impl Write, widgets: &[WidgetSession]) -> io::Result<()> {
    for ws in widgets {
        write_magic(w, MAGIC_WIDGET_SESSION)?;
        write_widget_session(w, ws)?;
    }
    write_magic(w, MAGIC_END_OF_LIST)
}

fn read_widget_session(r: &mut impl Read) -> io::Result<WidgetSession> {
    let id = read_string(r)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "widget session id must not be null")
    })?;
    let children = read_widget_sessions(r)?;
    let path_info = read_string(r)?;
    let query_string = read_string(r)?;
    read_magic(r, MAGIC_END_OF_RECORD)?;
    Ok(WidgetSession {
        id,
        children,
        path_info,
        query_string,
    })
}

fn read_widget_sessions(r: &mut impl Read) -> io::Result<Vec<WidgetSession>> {
    let mut out = Vec::new();
    loop {
        let magic = read_u32(r)?;
        if magic == MAGIC_END_OF_LIST {
            return Ok(out);
        }
        if magic != MAGIC_WIDGET_SESSION {
            return Err(bad_magic(MAGIC_WIDGET_SESSION, magic));
        }
        out.push(read_widget_session(r)?);
    }
}

fn write_cookie(w: &mut impl Write, cookie: &SessionCookie) -> io::Result<()> {
    write_string(w, Some(&cookie.name))?;
    write_string(w, Some(&cookie.value))?;
    write_string(w, cookie.domain.as_deref())?;
    write_string(w, cookie.path.as_deref())?;
    write_u64(w, cookie.expires)?;
    write_magic(w, MAGIC_END_OF_RECORD)
}

fn write_cookies(w: &mut impl Write, cookies: &[SessionCookie]) -> io::Result<()> {
    for cookie in cookies {
        write_magic(w, MAGIC_COOKIE)?;
        write_cookie(w, cookie)?;
    }
    write_magic(w, MAGIC_END_OF_LIST)
}

fn read_cookie(r: &mut impl Read) -> io::Result<SessionCookie> {
    let name = read_string(r)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "cookie name must not be null")
    })?;
    let value = read_string(r)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "cookie value must not be null")
    })?;
    let domain = read_string(r)?;
    let path = read_string(r)?;
    let expires = read_u64(r)?;
    read_magic(r, MAGIC_END_OF_RECORD)?;
    Ok(SessionCookie {
        name,
        value,
        domain,
        path,
        expires,
    })
}

fn read_cookies(r: &mut impl Read) -> io::Result<Vec<SessionCookie>> {
    let mut out = Vec::new();
    loop {
        let magic = read_u32(r)?;
        if magic == MAGIC_END_OF_LIST {
            return Ok(out);
        }
        if magic != MAGIC_COOKIE {
            return Err(bad_magic(MAGIC_COOKIE, magic));
        }
        out.push(read_cookie(r)?);
    }
}

fn write_session(w: &mut impl Write, session: &Session) -> io::Result<()> {
    write_u32(w, session.id.as_u32())?;
    write_u64(w, session.expires)?;
    write_u32(w, session.counter)?;
    write_bool(w, session.is_new)?;
    write_bool(w, session.cookie_sent)?;
    write_bool(w, session.cookie_received)?;
    write_string(w, Some(&session.realm))?;
    write_bytes(w, session.translate.as_deref())?;
    write_string(w, session.user.as_deref())?;
    write_u64(w, session.user_expires)?;
    write_string(w, session.language.as_deref())?;
    write_widget_sessions(w, &session.widgets)?;
    write_cookies(w, &session.cookies)?;
    write_magic(w, MAGIC_END_OF_RECORD)
}

fn read_session(r: &mut impl Read, pool: Arc<DPool>) -> io::Result<Session> {
    let id = SessionId::from(read_u32(r)?);
    let expires = read_u64(r)?;
    let counter = read_u32(r)?;
    let is_new = read_bool(r)?;
    let cookie_sent = read_bool(r)?;
    let cookie_received = read_bool(r)?;
    let realm = read_string(r)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "session realm must not be null")
    })?;
    let translate = read_bytes(r)?;
    let user = read_string(r)?;
    let user_expires = read_u64(r)?;
    let language = read_string(r)?;
    let widgets = read_widget_sessions(r)?;
    let cookies = read_cookies(r)?;
    read_magic(r, MAGIC_END_OF_RECORD)?;

    Ok(Session {
        id,
        realm,
        expires,
        counter,
        is_new,
        cookie_sent,
        cookie_received,
        translate,
        user,
        user_expires,
        language,
        widgets,
        cookies,
        pool,
    })
}

/// Serialize every session to `w`: `MAGIC_FILE` header, then a
/// `MAGIC_SESSION <record>` pair per session, terminated by
/// `MAGIC_END_OF_LIST`.
pub fn write_session_file<'a>(
    w: &mut impl Write,
    sessions: impl IntoIterator<Item = &'a Session>,
) -> io::Result<()> {
    write_magic(w, MAGIC_FILE)?;
    write_u32(w, 1)?; // format version; stands in for the original's sizeof(session)
    for session in sessions {
        write_magic(w, MAGIC_SESSION)?;
        write_session(w, session)?;
    }
    write_magic(w, MAGIC_END_OF_LIST)
}

/// Deserialize a session file written by [`write_session_file`]. Sessions
/// already expired at `now` (Unix seconds) are dropped, matching spec §8's
/// "round-trip yields a set equal to the original, modulo expired
/// sessions." Any magic mismatch aborts the whole load with an error —
/// there is no partial recovery.
pub fn read_session_file(
    r: &mut impl Read,
    pool_factory: impl Fn() -> Arc<DPool>,
    now: u64,
) -> io::Result<Vec<Session>> {
    read_magic(r, MAGIC_FILE)?;
    let _format_version = read_u32(r)?;

    let mut sessions = Vec::new();
    loop {
        let magic = read_u32(r)?;
        if magic == MAGIC_END_OF_LIST {
            return Ok(sessions);
        }
        if magic != MAGIC_SESSION {
            return Err(bad_magic(MAGIC_SESSION, magic));
        }
        let session = read_session(r, pool_factory())?;
        if session.expires > now {
            sessions.push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_shm::Shm;
    use std::io::Cursor;
    use std::sync::Arc;

    fn test_pool(shm: &Arc<Shm>) -> Arc<DPool> {
        Arc::new(DPool::try_new(shm.clone()).unwrap())
    }

    #[test]
    fn test_round_trip_preserves_fields_and_tree() {
        let shm = Arc::new(Shm::new(4096, 16));
        let mut session = Session::new(SessionId::from(42u32), "realm-a".into(), 9_999_999_999, test_pool(&shm));
        session.counter = 7;
        session.user = Some("alice".into());
        session.translate = Some(vec![1, 2, 3]);
        session.widgets.push(WidgetSession {
            id: "w1".into(),
            children: vec![WidgetSession {
                id: "w1.1".into(),
                children: vec![],
                path_info: None,
                query_string: Some("q=1".into()),
            }],
            path_info: Some("/a".into()),
            query_string: None,
        });
        session.cookies.push(SessionCookie {
            name: "sid".into(),
            value: "abc".into(),
            domain: Some("example.com".into()),
            path: None,
            expires: 123,
        });

        let mut buf = Vec::new();
        write_session_file(&mut buf, std::iter::once(&session)).unwrap();

        let mut cursor = Cursor::new(buf);
        let loaded = read_session_file(&mut cursor, || test_pool(&shm), 0).unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.id, session.id);
        assert_eq!(got.realm, "realm-a");
        assert_eq!(got.counter, 7);
        assert_eq!(got.user.as_deref(), Some("alice"));
        assert_eq!(got.translate, Some(vec![1, 2, 3]));
        assert_eq!(got.widgets, session.widgets);
        assert_eq!(got.cookies, session.cookies);
    }

    #[test]
    fn test_expired_sessions_are_dropped_on_load() {
        let shm = Arc::new(Shm::new(4096, 16));
        let session = Session::new(SessionId::from(1u32), "r".into(), 100, test_pool(&shm));
        let mut buf = Vec::new();
        write_session_file(&mut buf, std::iter::once(&session)).unwrap();

        let mut cursor = Cursor::new(buf);
        let loaded = read_session_file(&mut cursor, || test_pool(&shm), 9_999_999_999).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_magic_mismatch_aborts_whole_load() {
        let mut buf = Vec::new();
        write_u32(&mut buf, MAGIC_FILE).unwrap();
        write_u32(&mut buf, 1).unwrap();
        write_u32(&mut buf, 0xBAD).unwrap(); // neither MAGIC_SESSION nor MAGIC_END_OF_LIST

        let shm = Arc::new(Shm::new(4096, 4));
        let mut cursor = Cursor::new(buf);
        let result = read_session_file(&mut cursor, || test_pool(&shm), 0);
        assert!(result.is_err());
    }
}
