// Licensed under the Apache-2.0 license

#[cfg(test)]
mod test_recovery;
#[cfg(test)]
mod test_register_path;
#[cfg(test)]
mod test_sessions;
#[cfg(test)]
mod test_stream;
