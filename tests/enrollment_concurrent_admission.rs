mod test_support;

use serde_json::json;
use std::sync::{Arc, Barrier};
use test_support::{
    create_course, create_section, create_student, request, request_ok, select_workspace,
    spawn_sidecar, temp_dir,
};

const CAPACITY: i64 = 5;
const CONTENDERS: usize = 12;

#[test]
fn concurrent_sidecars_never_oversell_a_section() {
    let workspace = temp_dir("registrard-concurrent-admission");
    let (_seed_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let course = create_course(&mut stdin, &mut reader, "CS201", 3.0);
    let section = create_section(
        &mut stdin,
        &mut reader,
        &course,
        "CS201-01",
        "2024-2025",
        "1",
        CAPACITY,
    );
    let students: Vec<String> = (0..CONTENDERS)
        .map(|i| create_student(&mut stdin, &mut reader, &format!("RACE{:02}", i), 2024))
        .collect();

    let barrier = Arc::new(Barrier::new(CONTENDERS));
    let handles: Vec<_> = students
        .into_iter()
        .enumerate()
        .map(|(i, student)| {
            let barrier = Arc::clone(&barrier);
            let workspace = workspace.clone();
            let section = section.clone();
            std::thread::spawn(move || {
                let (mut child, mut stdin, mut reader) = spawn_sidecar();
                select_workspace(&mut stdin, &mut reader, &workspace);
                barrier.wait();
                let resp = request(
                    &mut stdin,
                    &mut reader,
                    &format!("race-{}", i),
                    "enrollments.create",
                    json!({ "input": { "studentId": student, "classSectionId": section } }),
                );
                drop(stdin);
                let _ = child.wait();
                resp
            })
        })
        .collect();

    let mut admitted = 0;
    let mut full = 0;
    for h in handles {
        let resp = h.join().expect("contender thread");
        if resp["ok"] == json!(true) {
            admitted += 1;
        } else {
            assert_eq!(
                resp.pointer("/error/code").and_then(|v| v.as_str()),
                Some("section_full"),
                "unexpected failure: {}",
                resp
            );
            full += 1;
        }
    }
    assert_eq!(admitted, CAPACITY as usize);
    assert_eq!(full, CONTENDERS - CAPACITY as usize);

    let section_view = request_ok(
        &mut stdin,
        &mut reader,
        "check",
        "sections.get",
        json!({ "sectionId": section }),
    );
    assert_eq!(section_view["section"]["occupied"], json!(CAPACITY));
}
