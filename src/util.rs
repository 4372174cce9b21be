/// Runs a closure when dropped unless [`defuse`][ScopeGuard::defuse]d first.
pub struct ScopeGuard<F: FnOnce()> {
    dropfn: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        self.dropfn = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(dropfn) = self.dropfn.take() {
            dropfn();
        }
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard { dropfn: Some(dropfn) }
}

/// Formats a byte slice as lowercase hex for log output.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn guard_runs_unless_defused() {
        let hits = Cell::new(0);
        {
            let _guard = defer(|| hits.set(hits.get() + 1));
        }
        assert_eq!(hits.get(), 1);

        let guard = defer(|| hits.set(hits.get() + 1));
        guard.defuse();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn hex_format() {
        assert_eq!(hex(&[0x01, 0xff, 0x00]), "01ff00");
    }
}
