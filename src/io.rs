// Non-blocking descriptor I/O for routines
//
// EAGAIN, EWOULDBLOCK and EINPROGRESS mean "wait for readiness and try
// again" and come back as nb::Error::WouldBlock; anything else is
// Other(errno). A routine typically does:
//
//     match io::read(fd, &mut self.buf) {
//         Err(nb::Error::WouldBlock) => cx.wait_fd(1, sel, fd, Events::IN),
//         Err(nb::Error::Other(e)) => cx.throw(e),
//         Ok(n) => ...
//     }

use crate::fdmon::RawFd;

#[inline]
pub fn must_wait(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINPROGRESS
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

fn classify(ret: isize) -> nb::Result<usize, i32> {
    if ret >= 0 {
        return Ok(ret as usize);
    }
    let e = last_errno();
    if must_wait(e) {
        Err(nb::Error::WouldBlock)
    } else {
        Err(nb::Error::Other(e))
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> nb::Result<usize, i32> {
    classify(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
}

pub fn write(fd: RawFd, buf: &[u8]) -> nb::Result<usize, i32> {
    classify(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
}

pub fn set_nonblocking(fd: RawFd) -> Result<(), i32> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_errno());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn empty_pipe_would_block() {
        let (r, w) = pipe();
        set_nonblocking(r).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read(r, &mut buf), Err(nb::Error::WouldBlock));

        assert_eq!(write(w, b"hi"), Ok(2));
        assert_eq!(read(r, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"hi");
        close(r);
        close(w);
    }

    #[test]
    fn bad_fd_is_an_error() {
        let mut buf = [0u8; 1];
        assert_eq!(read(-1, &mut buf), Err(nb::Error::Other(libc::EBADF)));
        assert!(!must_wait(libc::EBADF));
        assert!(must_wait(libc::EAGAIN));
    }
}
