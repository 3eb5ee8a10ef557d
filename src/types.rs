use nix::fcntl::OFlag;

/// How a file opened with [`crate::Ring::openat2`] may be used. Folded into
/// the final open flags alongside whatever the caller passes explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub(crate) fn open_flags(self) -> OFlag {
        match self {
            Access::Read => OFlag::O_RDONLY,
            Access::Write => OFlag::O_WRONLY,
            Access::ReadWrite => OFlag::O_RDWR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::read(Access::Read, libc::O_RDONLY)]
    #[case::write(Access::Write, libc::O_WRONLY)]
    #[case::read_write(Access::ReadWrite, libc::O_RDWR)]
    fn test_access_matches_host_flags(#[case] access: Access, #[case] expected: libc::c_int) {
        assert_eq!(access.open_flags().bits(), expected);
    }
}
