//! Library to backup MariaDB databases into a [Google shared drive][drive].
//!
//! A backup run dumps a database with `mariadb-dump` (see [`dump`]) and
//! uploads the dump into a folder of a shared drive (see [`drive`]). The
//! [`scheduler`] repeats runs daily, weekly or monthly at 04:00 local time.
//!
//! [drive]: https://support.google.com/a/users/answer/7212025

#![forbid(unsafe_code)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod drive;
pub mod dump;
pub mod pipeline;
pub mod scheduler;
