// dim-station: Workspace root library.
//
// Hosts the in-process harness the cross-component integration suites
// under tests/integration/ drive the station with: no sockets, real
// Station context, sessions wired straight to their queues.

pub mod harness;
