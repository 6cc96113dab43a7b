mod test_support;

use serde_json::json;
use test_support::{
    create_course, create_section, create_student, enroll, request_err, request_ok,
    select_workspace, spawn_sidecar, str_field, temp_dir,
};

#[test]
fn lecturers_are_unassigned_when_deleted() {
    let workspace = temp_dir("registrard-lecturers");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let dept = request_ok(
        &mut stdin,
        &mut reader,
        "d",
        "departments.create",
        json!({ "input": { "code": "CNTT", "name": "Information Technology" } }),
    );
    let dept_id = str_field(&dept, "departmentId");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "lecturers.create",
        json!({ "input": {
            "lecturerCode": "GV01",
            "lastName": "Tran",
            "firstName": "Binh",
            "position": "Lecturer",
            "departmentId": dept_id
        } }),
    );
    let lecturer_id = str_field(&created, "lecturerId");
    let dup = request_err(
        &mut stdin,
        &mut reader,
        "l1-dup",
        "lecturers.create",
        json!({ "input": { "lecturerCode": "GV01", "lastName": "X", "firstName": "Y" } }),
    );
    assert_eq!(dup, "conflict");
    let bad_dept = request_err(
        &mut stdin,
        &mut reader,
        "l-bad",
        "lecturers.create",
        json!({ "input": { "lecturerCode": "GV09", "lastName": "X", "firstName": "Y", "departmentId": "missing" } }),
    );
    assert_eq!(bad_dept, "not_found");

    // The department now has a lecturer and cannot be removed.
    let in_use = request_err(
        &mut stdin,
        &mut reader,
        "d-del",
        "departments.delete",
        json!({ "departmentId": dept_id }),
    );
    assert_eq!(in_use, "in_use");

    let course = create_course(&mut stdin, &mut reader, "INT101", 3.0);
    let section = create_section(&mut stdin, &mut reader, &course, "INT101-01", "2024-2025", "HK1", 40);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "s-upd",
        "sections.update",
        json!({ "sectionId": section, "patch": { "lecturerId": lecturer_id } }),
    );
    let got = request_ok(&mut stdin, &mut reader, "s-get", "sections.get", json!({ "sectionId": section }));
    assert_eq!(got["section"]["lecturerName"], json!("Tran Binh"));
    let by_lecturer = request_ok(
        &mut stdin,
        &mut reader,
        "s-list",
        "sections.list",
        json!({ "lecturerId": lecturer_id }),
    );
    assert_eq!(by_lecturer["total"], json!(1));
    let missing_lecturer = request_err(
        &mut stdin,
        &mut reader,
        "s-bad",
        "sections.update",
        json!({ "sectionId": section, "patch": { "lecturerId": "missing" } }),
    );
    assert_eq!(missing_lecturer, "not_found");

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c",
        "academicClasses.create",
        json!({ "input": { "classCode": "K65-CNTT1", "className": "CNTT 1", "cohort": 2024, "lecturerId": lecturer_id } }),
    );
    let class_id = str_field(&class, "academicClassId");

    let detail = request_ok(&mut stdin, &mut reader, "l-get", "lecturers.get", json!({ "lecturerId": lecturer_id }));
    assert_eq!(detail["lecturer"]["departmentName"], json!("Information Technology"));
    assert_eq!(detail["lecturer"]["position"], json!("Lecturer"));
    assert_eq!(detail["sectionCount"], json!(1));
    assert_eq!(detail["classCount"], json!(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l-list",
        "lecturers.list",
        json!({ "departmentId": dept_id, "search": "binh" }),
    );
    assert_eq!(listed["total"], json!(1));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "l-del",
        "lecturers.delete",
        json!({ "lecturerId": lecturer_id }),
    );
    assert_eq!(deleted["unassignedSections"], json!(1));
    assert_eq!(deleted["unassignedClasses"], json!(1));

    let section_after = request_ok(&mut stdin, &mut reader, "s-get2", "sections.get", json!({ "sectionId": section }));
    assert!(section_after["section"]["lecturerId"].is_null());
    let class_after = request_ok(
        &mut stdin,
        &mut reader,
        "c-get",
        "academicClasses.get",
        json!({ "academicClassId": class_id }),
    );
    assert!(class_after["academicClass"]["lecturerId"].is_null());

    let gone = request_err(&mut stdin, &mut reader, "l-get2", "lecturers.get", json!({ "lecturerId": lecturer_id }));
    assert_eq!(gone, "not_found");
}

#[test]
fn lecturers_bulk_delete_counts_rows() {
    let workspace = temp_dir("registrard-lecturers-bulk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let mut ids = Vec::new();
    for code in ["GV01", "GV02", "GV03"] {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            code,
            "lecturers.create",
            json!({ "input": { "lecturerCode": code, "lastName": "Le", "firstName": code } }),
        );
        ids.push(str_field(&res, "lecturerId"));
    }

    let empty = request_err(&mut stdin, &mut reader, "b0", "lecturers.bulkDelete", json!({ "lecturerIds": [] }));
    assert_eq!(empty, "bad_params");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "lecturers.bulkDelete",
        json!({ "lecturerIds": [ids[0], ids[1], "missing"] }),
    );
    assert_eq!(res["deletedLecturers"], json!(2));

    let left = request_ok(&mut stdin, &mut reader, "list", "lecturers.list", json!({}));
    assert_eq!(left["total"], json!(1));
    assert_eq!(left["items"][0]["lecturerCode"], json!("GV03"));
}

#[test]
fn academic_class_roster_and_delete_guard() {
    let workspace = temp_dir("registrard-academic-classes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let dept = request_ok(
        &mut stdin,
        &mut reader,
        "d",
        "departments.create",
        json!({ "input": { "code": "CNTT", "name": "Information Technology" } }),
    );
    let major = request_ok(
        &mut stdin,
        &mut reader,
        "m",
        "majors.create",
        json!({ "input": { "code": "KTPM", "name": "Software Engineering", "departmentId": str_field(&dept, "departmentId") } }),
    );
    let major_id = str_field(&major, "majorId");

    let bad_cohort = request_err(
        &mut stdin,
        &mut reader,
        "c-bad",
        "academicClasses.create",
        json!({ "input": { "classCode": "X", "className": "X", "cohort": 12 } }),
    );
    assert_eq!(bad_cohort, "bad_params");

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c",
        "academicClasses.create",
        json!({ "input": { "classCode": "K65-KTPM1", "className": "KTPM 1", "cohort": 2024, "majorId": major_id } }),
    );
    let class_id = str_field(&class, "academicClassId");

    let empty_roster = request_ok(
        &mut stdin,
        &mut reader,
        "r0",
        "academicClasses.students",
        json!({ "academicClassId": class_id }),
    );
    assert_eq!(empty_roster["students"], json!([]));
    assert_eq!(empty_roster["classInfo"]["majorName"], json!("Software Engineering"));

    for (code, first) in [("SV02", "Lan"), ("SV01", "Binh")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            code,
            "students.create",
            json!({ "input": {
                "studentCode": code,
                "lastName": "Pham",
                "firstName": first,
                "academicClassId": class_id
            } }),
        );
    }
    let missing_class = request_err(
        &mut stdin,
        &mut reader,
        "s-bad",
        "students.create",
        json!({ "input": { "studentCode": "SV03", "lastName": "A", "firstName": "B", "academicClassId": "missing" } }),
    );
    assert_eq!(missing_class, "not_found");

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "academicClasses.students",
        json!({ "academicClassId": class_id }),
    );
    assert_eq!(roster["classInfo"]["classCode"], json!("K65-KTPM1"));
    assert_eq!(roster["classInfo"]["departmentName"], json!("Information Technology"));
    assert_eq!(roster["students"][0]["firstName"], json!("Binh"));
    assert_eq!(roster["students"][1]["firstName"], json!("Lan"));

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "s-list",
        "students.list",
        json!({ "academicClassId": class_id }),
    );
    assert_eq!(filtered["total"], json!(2));
    assert_eq!(filtered["items"][0]["academicClassCode"], json!("K65-KTPM1"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "c-list",
        "academicClasses.list",
        json!({ "cohort": 2024, "majorId": major_id }),
    );
    assert_eq!(listed["total"], json!(1));
    assert_eq!(listed["items"][0]["studentCount"], json!(2));

    let in_use = request_err(
        &mut stdin,
        &mut reader,
        "c-del",
        "academicClasses.delete",
        json!({ "academicClassId": class_id }),
    );
    assert_eq!(in_use, "in_use");
    let major_in_use = request_err(
        &mut stdin,
        &mut reader,
        "m-del",
        "majors.delete",
        json!({ "majorId": major_id }),
    );
    assert_eq!(major_in_use, "in_use");

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "c-upd",
        "academicClasses.update",
        json!({ "academicClassId": class_id, "patch": { "className": "KTPM 01", "majorId": null } }),
    );
    assert_eq!(renamed["ok"], json!(true));
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "c-get",
        "academicClasses.get",
        json!({ "academicClassId": class_id }),
    );
    assert_eq!(got["academicClass"]["className"], json!("KTPM 01"));
    assert!(got["academicClass"]["majorId"].is_null());

    let stats = request_ok(&mut stdin, &mut reader, "stats", "dashboard.stats", json!({}));
    let labels: Vec<&str> = stats["stats"]
        .as_array()
        .expect("stats array")
        .iter()
        .filter_map(|s| s["label"].as_str())
        .collect();
    assert!(labels.contains(&"Lecturers"));
    let classes = stats["stats"]
        .as_array()
        .expect("stats array")
        .iter()
        .find(|s| s["label"] == json!("Classes"))
        .expect("classes entry");
    assert_eq!(classes["count"], json!(1));
}

#[test]
fn major_curriculum_add_list_remove() {
    let workspace = temp_dir("registrard-curriculum");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let major = request_ok(
        &mut stdin,
        &mut reader,
        "m",
        "majors.create",
        json!({ "input": { "code": "KTPM", "name": "Software Engineering" } }),
    );
    let major_id = str_field(&major, "majorId");
    let intro = create_course(&mut stdin, &mut reader, "INT101", 3.0);
    let db = create_course(&mut stdin, &mut reader, "INT202", 4.0);
    let elective = create_course(&mut stdin, &mut reader, "INT303", 2.0);

    for (id, course, semester, required) in [
        ("a1", &db, 2, true),
        ("a2", &intro, 1, true),
        ("a3", &elective, 3, false),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "majorCourses.add",
            json!({ "input": {
                "majorId": major_id,
                "courseId": course,
                "semester": semester,
                "year": 1,
                "isRequired": required
            } }),
        );
    }
    let dup = request_err(
        &mut stdin,
        &mut reader,
        "dup",
        "majorCourses.add",
        json!({ "input": { "majorId": major_id, "courseId": intro } }),
    );
    assert_eq!(dup, "conflict");
    let bad_semester = request_err(
        &mut stdin,
        &mut reader,
        "bad",
        "majorCourses.add",
        json!({ "input": { "majorId": major_id, "courseId": intro, "semester": 0 } }),
    );
    assert_eq!(bad_semester, "bad_params");
    let missing_major = request_err(&mut stdin, &mut reader, "l0", "majorCourses.list", json!({}));
    assert_eq!(missing_major, "bad_params");

    let listed = request_ok(&mut stdin, &mut reader, "l1", "majorCourses.list", json!({ "majorId": major_id }));
    assert_eq!(listed["total"], json!(3));
    assert_eq!(listed["items"][0]["courseCode"], json!("INT101"));
    assert_eq!(listed["items"][2]["isRequired"], json!(false));
    assert_eq!(listed["requiredCredits"], json!(7.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u",
        "majorCourses.update",
        json!({ "majorId": major_id, "courseId": elective, "patch": { "isRequired": true, "semester": 4 } }),
    );
    let after_update = request_ok(&mut stdin, &mut reader, "l2", "majorCourses.list", json!({ "majorId": major_id }));
    assert_eq!(after_update["requiredCredits"], json!(9.0));
    assert_eq!(after_update["items"][2]["semester"], json!(4));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "majorCourses.remove",
        json!({ "majorId": major_id, "courseId": db }),
    );
    let again = request_err(
        &mut stdin,
        &mut reader,
        "r2",
        "majorCourses.remove",
        json!({ "majorId": major_id, "courseId": db }),
    );
    assert_eq!(again, "not_found");

    // Deleting a course drops it from every curriculum.
    let removed = request_ok(&mut stdin, &mut reader, "c-del", "courses.delete", json!({ "courseId": elective }));
    assert_eq!(removed["removedCurriculumCourses"], json!(1));
    let left = request_ok(&mut stdin, &mut reader, "l3", "majorCourses.list", json!({ "majorId": major_id }));
    assert_eq!(left["total"], json!(1));

    let major_removed = request_ok(&mut stdin, &mut reader, "m-del", "majors.delete", json!({ "majorId": major_id }));
    assert_eq!(major_removed["removedCurriculumCourses"], json!(1));
}

#[test]
fn students_bulk_delete_cascades_in_one_call() {
    let workspace = temp_dir("registrard-students-bulk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let course = create_course(&mut stdin, &mut reader, "INT101", 3.0);
    let section = create_section(&mut stdin, &mut reader, &course, "INT101-01", "2024-2025", "HK1", 40);
    let a = create_student(&mut stdin, &mut reader, "SV01", 2024);
    let b = create_student(&mut stdin, &mut reader, "SV02", 2024);
    let keep = create_student(&mut stdin, &mut reader, "SV03", 2024);
    let graded = enroll(&mut stdin, &mut reader, &a, &section);
    let _ = enroll(&mut stdin, &mut reader, &b, &section);
    let _ = enroll(&mut stdin, &mut reader, &keep, &section);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g",
        "grades.create",
        json!({ "input": { "enrollmentId": graded, "attendance": 7, "midterm": 7, "assignment": 7, "final": 7 } }),
    );

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "bulk",
        "students.bulkDelete",
        json!({ "studentIds": [a, b, a] }),
    );
    assert_eq!(res["deletedStudents"], json!(2));
    assert_eq!(res["deletedEnrollments"], json!(2));
    assert_eq!(res["deletedGrades"], json!(1));

    let left = request_ok(&mut stdin, &mut reader, "list", "students.list", json!({}));
    assert_eq!(left["total"], json!(1));
    let seats = request_ok(&mut stdin, &mut reader, "s", "sections.get", json!({ "sectionId": section }));
    assert_eq!(seats["section"]["occupied"], json!(1));

    let bad = request_err(&mut stdin, &mut reader, "bad", "students.bulkDelete", json!({ "studentIds": "SV01" }));
    assert_eq!(bad, "bad_params");
}
